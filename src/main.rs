//! Diskforge - disk and boot assembly for Linux appliance images
//!
//! Sizes a prepared root tree, partitions the target disk and installs a
//! GRUB2 setup for the configured firmware.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use diskforge::boot::grub::{BootAssembler, MediaKind};
use diskforge::boot::signature::{DiskSignature, DiskSignatureProvider};
use diskforge::config::ImageConfig;
use diskforge::disk::detection::{filesystem_uuid, partition_path, TargetDisk};
use diskforge::disk::partitioning::GptPartitioner;
use diskforge::disk::size::{SizeEstimate, SizeEstimator};
use diskforge::utils::command::{CommandExecutor, CommandRunner};
use diskforge::utils::error::DiskforgeError;

#[derive(Parser)]
#[command(name = "diskforge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Dry run mode - show what would be done without making changes
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure the source tree and size an image for it
    Size {
        /// Path to configuration file
        #[arg(short, long, env = "DISKFORGE_CONFIG")]
        config: String,

        /// Print the estimate as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create the configured GPT partitions
    Partition {
        /// Path to configuration file
        #[arg(short, long, env = "DISKFORGE_CONFIG")]
        config: String,

        /// Target disk device, overriding the configuration
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Render, deploy and write the bootloader into the source tree
    Bootloader {
        /// Path to configuration file
        #[arg(short, long, env = "DISKFORGE_CONFIG")]
        config: String,

        /// Filesystem UUID of the root partition
        #[arg(short, long, required_unless_present = "partition")]
        uuid: Option<String>,

        /// Formatted root partition to read the filesystem UUID from
        #[arg(short, long, conflicts_with = "uuid")]
        partition: Option<String>,
    },

    /// Size, partition and install the bootloader in one run
    Build {
        /// Path to configuration file
        #[arg(short, long, env = "DISKFORGE_CONFIG")]
        config: String,

        /// Filesystem UUID the root partition will be formatted with
        #[arg(short, long)]
        uuid: String,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "diskforge.toml")]
        output: String,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let dry_run = cli.dry_run;
    if dry_run {
        info!("Running in dry-run mode - no changes will be made");
    }
    let runner = CommandRunner::new(dry_run);

    match cli.command {
        Commands::Size { config, json } => {
            let config = load_config(&config)?;
            let estimate = cmd_size(&runner, &config)?;
            print_estimate(&estimate, json)?;
        }
        Commands::Partition { config, device } => {
            require_root()?;
            let mut config = load_config(&config)?;
            if let Some(device) = device {
                config.disk.device = device;
            }
            let estimate = if config.needs_estimate() {
                Some(cmd_size(&runner, &config)?)
            } else {
                None
            };
            cmd_partition(&runner, &config, estimate.as_ref())?;
        }
        Commands::Bootloader {
            config,
            uuid,
            partition,
        } => {
            let config = load_config(&config)?;
            let uuid = match (uuid, partition) {
                (Some(uuid), _) => uuid,
                (None, Some(partition)) => filesystem_uuid(&runner, &partition)?,
                (None, None) => {
                    return Err(DiskforgeError::ConfigError(
                        "either --uuid or --partition is required".to_string(),
                    )
                    .into())
                }
            };
            cmd_bootloader(&runner, &config, &uuid)?;
        }
        Commands::Build { config, uuid } => {
            require_root()?;
            let config = load_config(&config)?;
            cmd_build(&runner, &config, &uuid)?;
        }
        Commands::Validate { config } => {
            let config = ImageConfig::from_file(&config)?;
            config.validate()?;
            println!("{} Configuration is valid", "✓".green());
        }
        Commands::GenerateConfig { output } => {
            let sample = ImageConfig::sample();
            let content = toml::to_string_pretty(&sample)?;
            std::fs::write(&output, content)?;
            println!("{} Sample configuration written to {}", "✓".green(), output);
        }
    }

    Ok(())
}

fn require_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(DiskforgeError::NotRoot.into());
    }
    Ok(())
}

fn load_config(path: &str) -> Result<ImageConfig> {
    info!("Loading configuration from {}", path);
    let config = ImageConfig::from_file(path)?;
    config.validate()?;
    Ok(config)
}

fn cmd_size(cmd: &dyn CommandExecutor, config: &ImageConfig) -> Result<SizeEstimate> {
    let estimator = SizeEstimator::new(cmd, &config.source_root);
    let requested = match config.filesystem.requested_mb {
        Some(mb) => mb,
        None => estimator.measure_usage_mbytes()?,
    };
    Ok(estimator.estimate(requested, config.filesystem.kind)?)
}

fn print_estimate(estimate: &SizeEstimate, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(estimate)?);
        return Ok(());
    }

    println!("{}", "Image size estimate".bold());
    println!("  {:<12} {} bytes", "usage", estimate.raw_usage_bytes);
    println!("  {:<12} {}", "entries", estimate.entry_count);
    println!("  {:<12} {}", "filesystem", estimate.filesystem_kind);
    println!(
        "  {:<12} {}",
        "size",
        format!("{} MB", estimate.result_megabytes).cyan()
    );
    Ok(())
}

/// Create all configured partitions, returning their numbers. Partitions
/// sized "auto" get the estimated image size.
fn cmd_partition(
    cmd: &dyn CommandExecutor,
    config: &ImageConfig,
    estimate: Option<&SizeEstimate>,
) -> Result<Vec<u32>> {
    let sizes = config.partition_sizes(estimate.map(|e| e.result_megabytes))?;
    let disk = if cmd.is_dry_run() {
        TargetDisk::new(config.disk.device.as_str())
    } else {
        TargetDisk::open(&config.disk.device)?
    };

    let mut partitioner = GptPartitioner::new(cmd, &disk);
    let mut numbers = Vec::with_capacity(sizes.len());
    for (part, size) in config.disk.partitions.iter().zip(sizes) {
        let number = partitioner.create(&part.name, size, part.type_flag, &part.flags)?;
        println!(
            "{} {} {} ({})",
            "✓".green(),
            partition_path(partitioner.device(), number),
            part.name,
            size
        );
        numbers.push(number);
    }
    Ok(numbers)
}

fn cmd_bootloader(cmd: &dyn CommandExecutor, config: &ImageConfig, uuid: &str) -> Result<()> {
    let probe = config.firmware();
    let mut boot = BootAssembler::initialize(
        cmd,
        &config.source_root,
        config.machine(),
        &probe,
        &probe,
        config.boot_settings(),
    )?;

    let media = config.bootloader.media;
    let signature = DiskSignature::generate();
    let render_id = match media {
        MediaKind::Install => {
            signature.write_marker(boot.config().source_root.as_path())?;
            signature.id()
        }
        MediaKind::Disk | MediaKind::Live => uuid.to_string(),
    };
    boot.render_config(media, &render_id)?;

    let efi_path = config.efi_boot_path();
    let written = if media == MediaKind::Install {
        // The EFI FAT image packs grub.cfg, so it is written first
        let written = boot.write()?;
        boot.deploy_images(media, uuid, &signature, efi_path.as_deref())?;
        written
    } else {
        boot.deploy_images(media, uuid, &signature, efi_path.as_deref())?;
        boot.write()?
    };

    for path in written {
        println!("{} {}", "✓".green(), path.display());
    }
    Ok(())
}

/// Size, partition and install the bootloader. The root filesystem is
/// created between partitioning and boot, so its UUID is supplied up front.
fn cmd_build(cmd: &dyn CommandExecutor, config: &ImageConfig, uuid: &str) -> Result<()> {
    let estimate = cmd_size(cmd, config)?;
    print_estimate(&estimate, false)?;

    let numbers = cmd_partition(cmd, config, Some(&estimate))?;
    info!(
        "Created {} partitions on {}, root filesystem UUID {}",
        numbers.len(),
        config.disk.device,
        uuid
    );

    cmd_bootloader(cmd, config, uuid)?;
    println!("{} Image assembled on {}", "✓".green(), config.disk.device);
    Ok(())
}
