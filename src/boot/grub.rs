//! GRUB2 configuration and boot image assembly
//!
//! A [`BootAssembler`] is bound to one source tree and one firmware mode.
//! It renders `grub.cfg`, deploys the firmware specific boot images into
//! the tree and finally writes the configuration next to them. Nothing is
//! rolled back: a failure part way through leaves earlier copies and
//! images in place.

use crate::boot::firmware::{
    Architecture, DomainProbe, FirmwareMode, FirmwareProbe, HypervisorDomain,
};
use crate::boot::signature::DiskSignatureProvider;
use crate::boot::template::{self, Substitutions, TemplateId, TemplateOptions, FAILSAFE_OPTIONS};
use crate::utils::command::CommandExecutor;
use crate::utils::error::{DiskforgeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Bootloader directory below /boot
pub const BOOTLOADER_DIR: &str = "grub2";

/// Tool building GRUB core images
pub const MKIMAGE: &str = "grub2-mkimage";

const CONFIG_NAME: &str = "grub.cfg";
const EARLYBOOT_NAME: &str = "earlyboot.cfg";
const FONT_NAME: &str = "unicode.pf2";

/// Font lookup directories, relative to the source root, in order
const FONT_DIRS: &[&str] = &["usr/share/grub2", "usr/share/grub"];

/// Signed binary lookup directories; `{arch}` is the machine name
const SIGNED_DIRS: &[&str] = &["usr/lib64/efi", "usr/share/efi/{arch}"];
const SHIM_NAME: &str = "shim.efi";
const SIGNED_GRUB_NAME: &str = "grub.efi";

const EFI_FAT_IMAGE_SIZE: &str = "4M";

const COMMON_MODULES: &[&str] = &[
    "ext2",
    "iso9660",
    "linux",
    "echo",
    "configfile",
    "search_label",
    "search_fs_file",
    "search",
    "search_fs_uuid",
    "ls",
    "normal",
    "gzio",
    "png",
    "fat",
    "gettext",
    "font",
    "minicmd",
    "gfxterm",
    "gfxmenu",
    "video",
    "video_fb",
    "xfs",
    "btrfs",
    "lvm",
    "multiboot",
];
const X86_EFI_MODULES: &[&str] = &["part_gpt", "efi_gop", "efi_uga", "linuxefi"];
const ARM_EFI_MODULES: &[&str] = &["part_gpt", "efi_gop"];
const PC_MODULES: &[&str] = &[
    "part_gpt",
    "part_msdos",
    "biosdisk",
    "vga",
    "vbe",
    "chain",
    "boot",
];

/// Kind of medium the boot files are assembled for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Disk,
    #[serde(alias = "install-media")]
    Install,
    #[serde(alias = "live-media")]
    Live,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disk => write!(f, "disk"),
            Self::Install => write!(f, "install-media"),
            Self::Live => write!(f, "live-media"),
        }
    }
}

/// One step of boot image deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    /// Copy the pre-signed shim and GRUB into the EFI boot directory
    SecureLoader,
    Font,
    EfiImage,
    BiosImage,
    ParavirtImage,
    /// Pack the EFI boot directory into a FAT image for install media
    EfiFatImage,
}

/// Stages deployed for a medium on a firmware, in order.
///
/// Every media/firmware pair is spelled out; pairs that are not
/// implemented fail instead of deploying nothing.
pub fn deployment_plan(
    media: MediaKind,
    firmware: FirmwareMode,
    arch: Architecture,
) -> Result<Vec<BootStage>> {
    use BootStage::*;

    let stages: &[BootStage] = match (media, firmware) {
        (MediaKind::Disk, FirmwareMode::Bios) => &[Font, BiosImage],
        (MediaKind::Disk, FirmwareMode::Efi) => &[Font, EfiImage, BiosImage],
        (MediaKind::Disk, FirmwareMode::EfiSecure) => &[SecureLoader, Font, BiosImage],
        (MediaKind::Disk, FirmwareMode::HypervisorParavirt) => &[Font, ParavirtImage],
        (MediaKind::Install, FirmwareMode::Bios) => &[Font, EfiImage, EfiFatImage],
        (MediaKind::Install, FirmwareMode::Efi) => &[Font, EfiImage, EfiFatImage],
        (MediaKind::Install, FirmwareMode::EfiSecure) => &[SecureLoader, Font, EfiFatImage],
        (MediaKind::Install, FirmwareMode::HypervisorParavirt) => {
            return Err(DiskforgeError::UnsupportedMedia(
                "install media cannot boot a paravirtualized guest".to_string(),
            ))
        }
        (MediaKind::Live, FirmwareMode::Bios)
        | (MediaKind::Live, FirmwareMode::Efi)
        | (MediaKind::Live, FirmwareMode::EfiSecure)
        | (MediaKind::Live, FirmwareMode::HypervisorParavirt) => {
            return Err(DiskforgeError::UnsupportedMedia(format!(
                "live media boot for {} firmware is not implemented",
                firmware
            )))
        }
    };

    Ok(stages
        .iter()
        .copied()
        .filter(|stage| *stage != BiosImage || arch.bios_target().is_some())
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageTarget {
    Bios,
    Efi,
    Paravirt,
}

fn image_modules(target: ImageTarget, arch: Architecture) -> Vec<&'static str> {
    let extra = match (target, arch) {
        (ImageTarget::Efi, Architecture::Aarch64) => ARM_EFI_MODULES,
        (ImageTarget::Efi, _) => X86_EFI_MODULES,
        (ImageTarget::Bios, _) | (ImageTarget::Paravirt, _) => PC_MODULES,
    };
    COMMON_MODULES
        .iter()
        .filter(|m| arch != Architecture::Aarch64 || **m != "multiboot")
        .chain(extra.iter())
        .copied()
        .collect()
}

/// Menu and layout settings supplied by the image description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSettings {
    pub title: String,
    pub timeout: u32,
    pub kernel: String,
    pub initrd: String,
    pub cmdline: String,
    /// Hypervisor binary loaded by multiboot entries
    pub hypervisor: String,
    /// Overrides the firmware dependent default terminal
    pub terminal: Option<String>,
    pub failsafe: bool,
    /// /boot lives on its own partition, so GRUB sees it as the root
    pub separate_boot_partition: bool,
    /// Replaces the built-in templates
    pub custom_template: Option<String>,
}

impl Default for BootSettings {
    fn default() -> Self {
        Self {
            title: "Linux Appliance".to_string(),
            timeout: 10,
            kernel: "vmlinuz".to_string(),
            initrd: "initrd".to_string(),
            cmdline: "quiet".to_string(),
            hypervisor: "xen.gz".to_string(),
            terminal: None,
            failsafe: true,
            separate_boot_partition: false,
            custom_template: None,
        }
    }
}

/// State of one bootloader assembly
#[derive(Debug, Clone)]
pub struct BootLoaderConfig {
    pub source_root: PathBuf,
    pub firmware_mode: FirmwareMode,
    pub hypervisor_domain: HypervisorDomain,
    pub media_kind: MediaKind,
    pub architecture: Architecture,
    pub multiboot: bool,
    pub terminal: String,
    /// Set by a render, taken by the next write
    pub rendered_text: Option<String>,
    pub efi_boot_path: Option<PathBuf>,
}

/// Pre-signed binaries used for secure boot
#[derive(Debug, Clone)]
struct SignedBinaries {
    shim: PathBuf,
    grub: PathBuf,
}

/// First-stage script baked into a core image
#[derive(Debug, Clone)]
struct EarlyBoot {
    search: String,
    prefix: String,
}

impl EarlyBoot {
    fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(format!("search {}\n", self.search).as_bytes())?;
        file.write_all(format!("set prefix=($root){}\n", self.prefix).as_bytes())?;
        debug!("Wrote early boot script {}", path.display());
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// Renders and deploys GRUB2 for a single firmware mode
pub struct BootAssembler<'a> {
    cmd: &'a dyn CommandExecutor,
    settings: BootSettings,
    config: BootLoaderConfig,
}

impl<'a> BootAssembler<'a> {
    /// Validate `machine` and resolve the firmware mode from the probes
    pub fn initialize(
        cmd: &'a dyn CommandExecutor,
        source_root: impl AsRef<Path>,
        machine: &str,
        firmware: &dyn FirmwareProbe,
        domain: &dyn DomainProbe,
        settings: BootSettings,
    ) -> Result<Self> {
        let architecture = Architecture::from_machine(machine)?;
        let firmware_mode = FirmwareMode::resolve(firmware);
        if !architecture.supports(firmware_mode) {
            return Err(DiskforgeError::Platform(format!(
                "{} firmware is not available on {}",
                firmware_mode, architecture
            )));
        }

        let hypervisor_domain = domain.hypervisor_domain();
        let multiboot = hypervisor_domain == HypervisorDomain::Privileged;
        let terminal = settings.terminal.clone().unwrap_or_else(|| {
            match firmware_mode {
                FirmwareMode::HypervisorParavirt => "console",
                _ => "gfxterm",
            }
            .to_string()
        });

        info!(
            "Bootloader for {} on {} firmware (domain {:?}, terminal {})",
            architecture, firmware_mode, hypervisor_domain, terminal
        );

        Ok(Self {
            cmd,
            settings,
            config: BootLoaderConfig {
                source_root: source_root.as_ref().to_path_buf(),
                firmware_mode,
                hypervisor_domain,
                media_kind: MediaKind::Disk,
                architecture,
                multiboot,
                terminal,
                rendered_text: None,
                efi_boot_path: None,
            },
        })
    }

    pub fn config(&self) -> &BootLoaderConfig {
        &self.config
    }

    pub fn set_multiboot(&mut self, multiboot: bool) {
        self.config.multiboot = multiboot;
    }

    fn boot_dir(&self) -> PathBuf {
        self.config.source_root.join("boot")
    }

    fn grub_dir(&self) -> PathBuf {
        self.boot_dir().join(BOOTLOADER_DIR)
    }

    /// Primary configuration file
    pub fn config_path(&self) -> PathBuf {
        self.grub_dir().join(CONFIG_NAME)
    }

    /// /boot as GRUB sees it on the disk image
    fn boot_path(&self) -> &'static str {
        if self.settings.separate_boot_partition {
            ""
        } else {
            "/boot"
        }
    }

    fn disk_prefix(&self) -> String {
        format!("{}/{}", self.boot_path(), BOOTLOADER_DIR)
    }

    fn default_efi_dir(&self, media: MediaKind) -> PathBuf {
        match media {
            MediaKind::Install | MediaKind::Live => self.config.source_root.join("EFI/BOOT"),
            MediaKind::Disk => self.boot_dir().join("efi/EFI/BOOT"),
        }
    }

    /// Render `grub.cfg` for `media`. `id` is the root filesystem UUID for
    /// disks and the disk signature for install media.
    pub fn render_config(&mut self, media: MediaKind, id: &str) -> Result<()> {
        let install = match media {
            MediaKind::Disk => false,
            MediaKind::Install => true,
            MediaKind::Live => {
                return Err(DiskforgeError::UnsupportedMedia(
                    "live media configuration is not implemented".to_string(),
                ))
            }
        };

        let template_id = TemplateId::select(install, self.config.multiboot);
        let options = TemplateOptions {
            failsafe: self.settings.failsafe,
            hybrid: install,
            terminal: self.config.terminal.clone(),
        };

        let (search_params, bootpath) = if install {
            (format!("--file --set=root /boot/{}", id), "/boot")
        } else {
            (format!("--fs-uuid --set=root {}", id), self.boot_path())
        };

        let mut values = Substitutions::new();
        values.insert("search_params", search_params);
        values.insert("default_boot", "0".to_string());
        values.insert("boot_timeout", self.settings.timeout.to_string());
        values.insert("bootpath", bootpath.to_string());
        values.insert("terminal", self.config.terminal.clone());
        values.insert("title", self.settings.title.clone());
        values.insert("kernel_file", self.settings.kernel.clone());
        values.insert("initrd_file", self.settings.initrd.clone());
        values.insert("boot_options", self.settings.cmdline.clone());
        values.insert("failsafe_boot_options", FAILSAFE_OPTIONS.to_string());
        values.insert("hypervisor", self.settings.hypervisor.clone());

        let text = match &self.settings.custom_template {
            Some(custom) => template::substitute(custom, &values)?,
            None => template::render(template_id, &options, &values)?,
        };

        info!("Rendered {:?} bootloader template for {}", template_id, media);
        self.config.media_kind = media;
        self.config.rendered_text = Some(text);
        if install || self.config.firmware_mode.is_efi() {
            self.config.efi_boot_path = Some(self.default_efi_dir(media));
        }
        Ok(())
    }

    /// Deploy the boot images of a disk image. `efi_path` replaces the
    /// default EFI boot directory `<root>/boot/efi/EFI/BOOT`.
    pub fn deploy_boot_images(&mut self, fs_uuid: &str, efi_path: Option<&Path>) -> Result<()> {
        let efi_dir = efi_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_efi_dir(MediaKind::Disk));

        let early = EarlyBoot {
            search: format!("--fs-uuid --set=root {}", fs_uuid),
            prefix: self.disk_prefix(),
        };
        self.deploy(MediaKind::Disk, &early, &efi_dir)?;

        if efi_path.is_some() || self.config.firmware_mode.is_efi() {
            self.config.efi_boot_path = Some(efi_dir);
        }
        Ok(())
    }

    /// Deploy the boot images of an install medium, including the FAT
    /// image EFI firmware boots from
    pub fn deploy_install_images(&mut self, signature: &dyn DiskSignatureProvider) -> Result<()> {
        let efi_dir = self.default_efi_dir(MediaKind::Install);

        let early = EarlyBoot {
            search: format!("--file --set=root /boot/{}", signature.id()),
            prefix: format!("/boot/{}", BOOTLOADER_DIR),
        };
        self.deploy(MediaKind::Install, &early, &efi_dir)?;

        self.config.efi_boot_path = Some(efi_dir);
        Ok(())
    }

    /// Deploy for any medium; live media is rejected
    pub fn deploy_images(
        &mut self,
        media: MediaKind,
        id: &str,
        signature: &dyn DiskSignatureProvider,
        efi_path: Option<&Path>,
    ) -> Result<()> {
        match media {
            MediaKind::Disk => self.deploy_boot_images(id, efi_path),
            MediaKind::Install => self.deploy_install_images(signature),
            MediaKind::Live => Err(DiskforgeError::UnsupportedMedia(
                "live media boot images are not implemented".to_string(),
            )),
        }
    }

    fn deploy(&mut self, media: MediaKind, early: &EarlyBoot, efi_dir: &Path) -> Result<()> {
        let arch = self.config.architecture;
        let stages = deployment_plan(media, self.config.firmware_mode, arch)?;

        // Signed binaries are verified before anything is touched
        let signed = if stages.contains(&BootStage::SecureLoader) {
            Some(self.signed_binaries()?)
        } else {
            None
        };

        for stage in stages {
            debug!("Boot stage {:?}", stage);
            match stage {
                BootStage::SecureLoader => {
                    if let Some(signed) = &signed {
                        self.install_signed_loader(signed, efi_dir)?;
                    }
                }
                BootStage::Font => self.copy_font()?,
                BootStage::EfiImage => {
                    let platform = arch.efi_target();
                    self.copy_modules(platform)?;
                    let earlyboot = efi_dir.join(EARLYBOOT_NAME);
                    early.write(&earlyboot)?;
                    let output = efi_dir.join(arch.efi_image_name());
                    self.build_core_image(ImageTarget::Efi, platform, &output, &earlyboot, early)?;
                }
                BootStage::BiosImage => {
                    let platform = arch.bios_target().ok_or_else(|| {
                        DiskforgeError::Platform(format!("no BIOS target on {}", arch))
                    })?;
                    self.build_grub_dir_image(ImageTarget::Bios, platform, early)?;
                }
                BootStage::ParavirtImage => {
                    let platform = arch.paravirt_target().ok_or_else(|| {
                        DiskforgeError::Platform(format!("no paravirt target on {}", arch))
                    })?;
                    self.build_grub_dir_image(ImageTarget::Paravirt, platform, early)?;
                }
                BootStage::EfiFatImage => self.build_efi_fat_image()?,
            }
        }

        info!(
            "Deployed {} boot images for {} firmware",
            media, self.config.firmware_mode
        );
        Ok(())
    }

    /// Locate shim and signed GRUB, shim first
    fn signed_binaries(&self) -> Result<SignedBinaries> {
        let shim = self.find_signed(SHIM_NAME).ok_or_else(|| {
            DiskforgeError::SecureBoot(format!("no signed {} found in the source tree", SHIM_NAME))
        })?;
        let grub = self.find_signed(SIGNED_GRUB_NAME).ok_or_else(|| {
            DiskforgeError::SecureBoot(format!(
                "no signed {} found in the source tree",
                SIGNED_GRUB_NAME
            ))
        })?;
        Ok(SignedBinaries { shim, grub })
    }

    fn find_signed(&self, name: &str) -> Option<PathBuf> {
        let machine = self.config.architecture.machine();
        SIGNED_DIRS
            .iter()
            .map(|dir| {
                self.config
                    .source_root
                    .join(dir.replace("{arch}", machine))
                    .join(name)
            })
            .find(|path| path.is_file())
    }

    fn install_signed_loader(&self, signed: &SignedBinaries, efi_dir: &Path) -> Result<()> {
        info!("Installing signed shim loader into {}", efi_dir.display());
        fs::create_dir_all(efi_dir)?;
        let shim = path_arg(&signed.shim);
        let loader = path_arg(&efi_dir.join(self.config.architecture.efi_image_name()));
        self.cmd.run("cp", &[shim.as_str(), loader.as_str()])?;
        let grub = path_arg(&signed.grub);
        let dir = path_arg(efi_dir);
        self.cmd.run("cp", &[grub.as_str(), dir.as_str()])?;
        Ok(())
    }

    fn copy_font(&self) -> Result<()> {
        let target = self.boot_dir().join(FONT_NAME);
        if target.exists() {
            debug!("Font already present at {}", target.display());
            return Ok(());
        }

        let source = FONT_DIRS
            .iter()
            .map(|dir| self.config.source_root.join(dir).join(FONT_NAME))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                DiskforgeError::Font(format!("{} not found in the source tree", FONT_NAME))
            })?;

        fs::create_dir_all(self.boot_dir())?;
        let (source, target) = (path_arg(&source), path_arg(&target));
        self.cmd
            .run("cp", &[source.as_str(), target.as_str()])
            .map_err(|e| DiskforgeError::Font(format!("copying {} failed: {}", FONT_NAME, e)))?;
        Ok(())
    }

    fn copy_modules(&self, platform: &str) -> Result<()> {
        let target = self.grub_dir().join(platform);
        if target.exists() {
            debug!("Modules already present at {}", target.display());
            return Ok(());
        }

        let source = self
            .config
            .source_root
            .join("usr/lib")
            .join(BOOTLOADER_DIR)
            .join(platform);
        if !source.is_dir() {
            return Err(DiskforgeError::Modules(format!(
                "module directory {} does not exist",
                source.display()
            )));
        }

        fs::create_dir_all(self.grub_dir())?;
        self.cmd
            .run("cp", &["-a", &path_arg(&source), &path_arg(&target)])
            .map_err(|e| DiskforgeError::Modules(format!("copying {} failed: {}", platform, e)))?;
        Ok(())
    }

    /// Core image living in the GRUB directory (BIOS and paravirt)
    fn build_grub_dir_image(
        &self,
        target: ImageTarget,
        platform: &str,
        early: &EarlyBoot,
    ) -> Result<()> {
        self.copy_modules(platform)?;
        let earlyboot = self.grub_dir().join(EARLYBOOT_NAME);
        early.write(&earlyboot)?;
        let output = self.grub_dir().join(platform).join("core.img");
        self.build_core_image(target, platform, &output, &earlyboot, early)
    }

    fn build_core_image(
        &self,
        target: ImageTarget,
        platform: &str,
        output: &Path,
        earlyboot: &Path,
        early: &EarlyBoot,
    ) -> Result<()> {
        info!("Building {} core image {}", platform, output.display());
        let module_dir = self.grub_dir().join(platform);
        let mut args = vec![
            "-O".to_string(),
            platform.to_string(),
            "-o".to_string(),
            path_arg(output),
            "-c".to_string(),
            path_arg(earlyboot),
            "-p".to_string(),
            early.prefix.clone(),
            "-d".to_string(),
            path_arg(&module_dir),
        ];
        args.extend(
            image_modules(target, self.config.architecture)
                .into_iter()
                .map(str::to_string),
        );
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.cmd.run(MKIMAGE, &args)?;
        Ok(())
    }

    fn build_efi_fat_image(&self) -> Result<()> {
        let image_dir = self.boot_dir().join(self.config.architecture.machine());
        fs::create_dir_all(&image_dir)?;
        let image = path_arg(&image_dir.join("efi"));
        let efi_tree = path_arg(&self.config.source_root.join("EFI"));

        info!("Packing {} into EFI image {}", efi_tree, image);
        self.cmd
            .run("qemu-img", &["create", &image, EFI_FAT_IMAGE_SIZE])?;
        self.cmd.run("mkdosfs", &["-n", "BOOT", &image])?;
        self.cmd
            .run("mcopy", &["-Do", "-s", "-i", &image, &efi_tree, "::"])?;
        Ok(())
    }

    /// Write the rendered configuration to the primary path, then to the
    /// EFI boot directory when one is set. Returns the paths written.
    ///
    /// The rendered text is consumed only once every copy is on disk, so a
    /// failed write can be retried.
    pub fn write(&mut self) -> Result<Vec<PathBuf>> {
        let text = self
            .config
            .rendered_text
            .as_deref()
            .ok_or(DiskforgeError::ConfigNotRendered)?;

        let mut targets = vec![self.config_path()];
        if let Some(efi_dir) = &self.config.efi_boot_path {
            targets.push(efi_dir.join(CONFIG_NAME));
        }

        for target in &targets {
            write_file(target, text)?;
            info!("Wrote bootloader configuration {}", target.display());
        }

        self.config.rendered_text = None;
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::firmware::{ConfiguredFirmware, FirmwareSetting};
    use crate::boot::signature::DiskSignature;
    use crate::utils::command::testing::{argv, RecordingRunner};
    use tempfile::TempDir;

    fn firmware(setting: FirmwareSetting) -> ConfiguredFirmware {
        ConfiguredFirmware {
            firmware: setting,
            domain: HypervisorDomain::None,
        }
    }

    /// Source tree with fonts, module directories and signed binaries
    fn source_tree() -> TempDir {
        let root = tempfile::tempdir().unwrap();
        let p = root.path();
        fs::create_dir_all(p.join("usr/share/grub2")).unwrap();
        fs::write(p.join("usr/share/grub2/unicode.pf2"), "font").unwrap();
        for platform in ["i386-pc", "x86_64-efi", "x86_64-xen", "arm64-efi"] {
            fs::create_dir_all(p.join("usr/lib/grub2").join(platform)).unwrap();
        }
        fs::create_dir_all(p.join("usr/lib64/efi")).unwrap();
        fs::write(p.join("usr/lib64/efi/shim.efi"), "shim").unwrap();
        fs::write(p.join("usr/lib64/efi/grub.efi"), "grub").unwrap();
        root
    }

    fn assembler<'a>(
        runner: &'a RecordingRunner,
        root: &Path,
        setting: FirmwareSetting,
    ) -> BootAssembler<'a> {
        let probe = firmware(setting);
        BootAssembler::initialize(runner, root, "x86_64", &probe, &probe, BootSettings::default())
            .unwrap()
    }

    fn at(root: &Path, rel: &str) -> String {
        path_arg(&root.join(rel))
    }

    fn mkimage(root: &Path, platform: &str, output: &str, earlyboot: &str, prefix: &str) -> Vec<String> {
        let module_dir = format!("boot/grub2/{}", platform);
        let mut call = argv(&[
            MKIMAGE,
            "-O",
            platform,
            "-o",
            &at(root, output),
            "-c",
            &at(root, earlyboot),
            "-p",
            prefix,
            "-d",
            &at(root, &module_dir),
        ]);
        let target = if platform.ends_with("efi") {
            ImageTarget::Efi
        } else {
            ImageTarget::Bios
        };
        call.extend(
            image_modules(target, Architecture::X86_64)
                .into_iter()
                .map(str::to_string),
        );
        call
    }

    #[test]
    fn unsupported_architecture_fails() {
        let runner = RecordingRunner::new();
        let probe = firmware(FirmwareSetting::Bios);
        let result = BootAssembler::initialize(
            &runner,
            "source_dir",
            "unsupported-arch",
            &probe,
            &probe,
            BootSettings::default(),
        );
        assert!(matches!(result, Err(DiskforgeError::Platform(_))));
    }

    #[test]
    fn bios_on_aarch64_fails() {
        let runner = RecordingRunner::new();
        let probe = firmware(FirmwareSetting::Bios);
        let result = BootAssembler::initialize(
            &runner,
            "source_dir",
            "aarch64",
            &probe,
            &probe,
            BootSettings::default(),
        );
        assert!(matches!(result, Err(DiskforgeError::Platform(_))));
    }

    #[test]
    fn dom0_enables_multiboot() {
        let runner = RecordingRunner::new();
        let probe = ConfiguredFirmware {
            firmware: FirmwareSetting::Bios,
            domain: HypervisorDomain::Privileged,
        };
        let boot = BootAssembler::initialize(
            &runner,
            "source_dir",
            "x86_64",
            &probe,
            &probe,
            BootSettings::default(),
        )
        .unwrap();
        assert_eq!(boot.config().hypervisor_domain, HypervisorDomain::Privileged);
        assert!(boot.config().multiboot);
        assert_eq!(boot.config().firmware_mode, FirmwareMode::Bios);
    }

    #[test]
    fn default_terminal_follows_firmware() {
        let runner = RecordingRunner::new();
        let boot = assembler(&runner, Path::new("source_dir"), FirmwareSetting::Efi);
        assert_eq!(boot.config().terminal, "gfxterm");
        let boot = assembler(&runner, Path::new("source_dir"), FirmwareSetting::Ec2);
        assert_eq!(boot.config().terminal, "console");
    }

    #[test]
    fn render_disk_multiboot() {
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, Path::new("source_dir"), FirmwareSetting::Bios);
        boot.set_multiboot(true);
        boot.render_config(MediaKind::Disk, "uuid").unwrap();
        let text = boot.config().rendered_text.clone().unwrap();
        assert!(text.contains("search --fs-uuid --set=root uuid"));
        assert!(text.contains("multiboot ($root)/boot/xen.gz"));
        assert!(text.contains("terminal_output gfxterm"));
        assert!(boot.config().efi_boot_path.is_none());
    }

    #[test]
    fn render_install_standard() {
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, Path::new("source_dir"), FirmwareSetting::Bios);
        boot.render_config(MediaKind::Install, "0xffffffff").unwrap();
        let text = boot.config().rendered_text.clone().unwrap();
        assert!(text.contains("search --file --set=root /boot/0xffffffff"));
        assert!(text.contains("Boot from Hard Disk"));
        assert!(text.contains("Failsafe"));
        assert!(!text.contains("multiboot ("));
        assert_eq!(
            boot.config().efi_boot_path,
            Some(Path::new("source_dir").join("EFI/BOOT"))
        );
    }

    #[test]
    fn separate_boot_partition_drops_boot_prefix() {
        let runner = RecordingRunner::new();
        let probe = firmware(FirmwareSetting::Bios);
        let settings = BootSettings {
            separate_boot_partition: true,
            ..BootSettings::default()
        };
        let mut boot =
            BootAssembler::initialize(&runner, "source_dir", "x86_64", &probe, &probe, settings)
                .unwrap();
        boot.render_config(MediaKind::Disk, "uuid").unwrap();
        let text = boot.config().rendered_text.clone().unwrap();
        assert!(text.contains("linux ($root)/vmlinuz quiet"));
    }

    #[test]
    fn substitution_failure_becomes_template_error() {
        let runner = RecordingRunner::new();
        let probe = firmware(FirmwareSetting::Bios);
        let settings = BootSettings {
            custom_template: Some("search ${search_params}\n${undefined}\n".to_string()),
            ..BootSettings::default()
        };
        let mut boot =
            BootAssembler::initialize(&runner, "source_dir", "x86_64", &probe, &probe, settings)
                .unwrap();
        let err = boot.render_config(MediaKind::Disk, "uuid").unwrap_err();
        assert!(matches!(err, DiskforgeError::Template(_)));
        assert!(boot.config().rendered_text.is_none());
    }

    #[test]
    fn live_media_fails_loudly() {
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, Path::new("source_dir"), FirmwareSetting::Efi);
        assert!(matches!(
            boot.render_config(MediaKind::Live, "mbrid"),
            Err(DiskforgeError::UnsupportedMedia(_))
        ));
        assert!(matches!(
            boot.deploy_images(MediaKind::Live, "mbrid", &DiskSignature::new(1), None),
            Err(DiskforgeError::UnsupportedMedia(_))
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn every_pair_has_a_plan_or_an_error() {
        let modes = [
            FirmwareMode::Bios,
            FirmwareMode::Efi,
            FirmwareMode::EfiSecure,
            FirmwareMode::HypervisorParavirt,
        ];
        for mode in modes {
            assert!(!deployment_plan(MediaKind::Disk, mode, Architecture::X86_64)
                .unwrap()
                .is_empty());
            assert!(deployment_plan(MediaKind::Live, mode, Architecture::X86_64).is_err());
        }
        assert!(deployment_plan(
            MediaKind::Install,
            FirmwareMode::HypervisorParavirt,
            Architecture::X86_64
        )
        .is_err());
        assert_eq!(
            deployment_plan(MediaKind::Disk, FirmwareMode::Efi, Architecture::Aarch64).unwrap(),
            vec![BootStage::Font, BootStage::EfiImage]
        );
    }

    #[test]
    fn write_copies_config_to_efi_path() {
        let root = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root.path(), FirmwareSetting::Bios);
        boot.config.rendered_text = Some("some-data".to_string());
        boot.config.efi_boot_path = Some(root.path().join("boot/efi/EFI/BOOT"));

        let written = boot.write().unwrap();
        assert_eq!(
            written,
            vec![
                root.path().join("boot/grub2/grub.cfg"),
                root.path().join("boot/efi/EFI/BOOT/grub.cfg"),
            ]
        );
        for path in &written {
            assert_eq!(fs::read_to_string(path).unwrap(), "some-data");
        }
    }

    #[test]
    fn write_consumes_the_rendered_text() {
        let root = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root.path(), FirmwareSetting::Bios);
        boot.render_config(MediaKind::Disk, "uuid").unwrap();
        assert_eq!(boot.write().unwrap().len(), 1);
        assert!(matches!(boot.write(), Err(DiskforgeError::ConfigNotRendered)));
    }

    #[test]
    fn failed_write_keeps_the_rendered_text() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("boot"), "not a directory").unwrap();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root.path(), FirmwareSetting::Bios);
        boot.render_config(MediaKind::Disk, "uuid").unwrap();

        assert!(matches!(boot.write(), Err(DiskforgeError::Io(_))));
        assert!(boot.config().rendered_text.is_some());

        fs::remove_file(root.path().join("boot")).unwrap();
        assert_eq!(
            boot.write().unwrap(),
            vec![root.path().join("boot/grub2/grub.cfg")]
        );
        assert!(boot.config().rendered_text.is_none());
    }

    #[test]
    fn deploy_images_dispatches_by_media() {
        let tree = source_tree();
        let root = tree.path();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Bios);
        let signature = DiskSignature::new(0xffffffff);

        boot.deploy_images(MediaKind::Disk, "0815", &signature, None)
            .unwrap();
        assert!(root.join("boot/grub2/earlyboot.cfg").exists());
        assert!(!root.join("EFI").exists());

        boot.deploy_images(MediaKind::Install, "0815", &signature, None)
            .unwrap();
        assert_eq!(
            fs::read_to_string(root.join("EFI/BOOT/earlyboot.cfg")).unwrap(),
            "search --file --set=root /boot/0xffffffff\nset prefix=($root)/boot/grub2\n"
        );
    }

    #[test]
    fn disk_images_for_bios_plus_efi() {
        let tree = source_tree();
        let root = tree.path();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Efi);
        boot.deploy_boot_images("0815", None).unwrap();

        let early = "search --fs-uuid --set=root 0815\nset prefix=($root)/boot/grub2\n";
        assert_eq!(
            fs::read_to_string(root.join("boot/efi/EFI/BOOT/earlyboot.cfg")).unwrap(),
            early
        );
        assert_eq!(
            fs::read_to_string(root.join("boot/grub2/earlyboot.cfg")).unwrap(),
            early
        );
        assert_eq!(
            runner.calls(),
            vec![
                argv(&[
                    "cp",
                    &at(root, "usr/share/grub2/unicode.pf2"),
                    &at(root, "boot/unicode.pf2")
                ]),
                argv(&[
                    "cp",
                    "-a",
                    &at(root, "usr/lib/grub2/x86_64-efi"),
                    &at(root, "boot/grub2/x86_64-efi")
                ]),
                mkimage(
                    root,
                    "x86_64-efi",
                    "boot/efi/EFI/BOOT/bootx64.efi",
                    "boot/efi/EFI/BOOT/earlyboot.cfg",
                    "/boot/grub2"
                ),
                argv(&[
                    "cp",
                    "-a",
                    &at(root, "usr/lib/grub2/i386-pc"),
                    &at(root, "boot/grub2/i386-pc")
                ]),
                mkimage(
                    root,
                    "i386-pc",
                    "boot/grub2/i386-pc/core.img",
                    "boot/grub2/earlyboot.cfg",
                    "/boot/grub2"
                ),
            ]
        );
        assert_eq!(
            boot.config().efi_boot_path,
            Some(root.join("boot/efi/EFI/BOOT"))
        );
    }

    #[test]
    fn efi_module_list_is_pinned() {
        let modules = image_modules(ImageTarget::Efi, Architecture::X86_64);
        assert_eq!(modules.len(), COMMON_MODULES.len() + 4);
        assert_eq!(&modules[modules.len() - 4..], X86_EFI_MODULES);
        let modules = image_modules(ImageTarget::Efi, Architecture::Aarch64);
        assert!(!modules.contains(&"multiboot"));
        assert!(!modules.contains(&"linuxefi"));
    }

    #[test]
    fn disk_images_for_paravirt_guest() {
        let tree = source_tree();
        let root = tree.path();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Ec2);
        boot.deploy_boot_images("0815", None).unwrap();

        assert!(root.join("boot/grub2/earlyboot.cfg").exists());
        assert!(!root.join("boot/efi").exists());
        assert!(boot.config().efi_boot_path.is_none());
        assert_eq!(
            runner.calls(),
            vec![
                argv(&[
                    "cp",
                    &at(root, "usr/share/grub2/unicode.pf2"),
                    &at(root, "boot/unicode.pf2")
                ]),
                argv(&[
                    "cp",
                    "-a",
                    &at(root, "usr/lib/grub2/x86_64-xen"),
                    &at(root, "boot/grub2/x86_64-xen")
                ]),
                mkimage(
                    root,
                    "x86_64-xen",
                    "boot/grub2/x86_64-xen/core.img",
                    "boot/grub2/earlyboot.cfg",
                    "/boot/grub2"
                ),
            ]
        );
    }

    #[test]
    fn secure_boot_copies_signed_binaries_first() {
        let tree = source_tree();
        let root = tree.path();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Uefi);
        boot.deploy_boot_images("uuid", None).unwrap();

        let calls = runner.calls();
        assert_eq!(
            calls[0],
            argv(&[
                "cp",
                &at(root, "usr/lib64/efi/shim.efi"),
                &at(root, "boot/efi/EFI/BOOT/bootx64.efi")
            ])
        );
        assert_eq!(
            calls[1],
            argv(&[
                "cp",
                &at(root, "usr/lib64/efi/grub.efi"),
                &at(root, "boot/efi/EFI/BOOT")
            ])
        );
        assert!(calls.iter().all(|c| c[1] != "-O" || c[2] != "x86_64-efi"));
    }

    #[test]
    fn secure_boot_without_shim_fails_before_any_change() {
        let tree = source_tree();
        let root = tree.path();
        fs::remove_file(root.join("usr/lib64/efi/shim.efi")).unwrap();
        fs::remove_file(root.join("usr/lib64/efi/grub.efi")).unwrap();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Uefi);

        let err = boot.deploy_boot_images("uuid", None).unwrap_err();
        assert!(matches!(&err, DiskforgeError::SecureBoot(msg) if msg.contains("shim.efi")));
        assert!(runner.calls().is_empty());
        assert!(!root.join("boot").exists());
    }

    #[test]
    fn failed_secure_boot_keeps_efi_path_unset() {
        let tree = source_tree();
        let root = tree.path();
        fs::remove_file(root.join("usr/lib64/efi/shim.efi")).unwrap();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Uefi);

        let err = boot
            .deploy_boot_images("uuid", Some(&root.join("esp")))
            .unwrap_err();
        assert!(matches!(err, DiskforgeError::SecureBoot(_)));
        assert!(boot.config().efi_boot_path.is_none());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn failed_install_deploy_keeps_efi_path_unset() {
        let tree = source_tree();
        let root = tree.path();
        fs::remove_file(root.join("usr/lib64/efi/grub.efi")).unwrap();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Uefi);

        assert!(boot
            .deploy_install_images(&DiskSignature::new(1))
            .is_err());
        assert!(boot.config().efi_boot_path.is_none());
    }

    #[test]
    fn secure_boot_without_signed_grub_fails() {
        let tree = source_tree();
        let root = tree.path();
        fs::remove_file(root.join("usr/lib64/efi/grub.efi")).unwrap();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Uefi);

        let err = boot.deploy_boot_images("uuid", None).unwrap_err();
        assert!(matches!(&err, DiskforgeError::SecureBoot(msg) if msg.contains("grub.efi")));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn missing_font_fails() {
        let tree = source_tree();
        let root = tree.path();
        fs::remove_file(root.join("usr/share/grub2/unicode.pf2")).unwrap();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Bios);
        assert!(matches!(
            boot.deploy_boot_images("0815", None),
            Err(DiskforgeError::Font(_))
        ));
    }

    #[test]
    fn font_falls_back_and_tolerates_existing_copy() {
        let tree = source_tree();
        let root = tree.path();
        fs::remove_file(root.join("usr/share/grub2/unicode.pf2")).unwrap();
        fs::create_dir_all(root.join("usr/share/grub")).unwrap();
        fs::write(root.join("usr/share/grub/unicode.pf2"), "font").unwrap();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Bios);
        boot.deploy_boot_images("0815", None).unwrap();
        assert_eq!(runner.calls()[0][1], at(root, "usr/share/grub/unicode.pf2"));

        fs::write(root.join("boot/unicode.pf2"), "font").unwrap();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Bios);
        boot.deploy_boot_images("0815", None).unwrap();
        assert!(runner.calls().iter().all(|c| !c.iter().any(|a| a.ends_with("unicode.pf2"))));
    }

    #[test]
    fn failed_font_copy_is_a_font_error() {
        let tree = source_tree();
        let runner = RecordingRunner::new().failing("cp");
        let mut boot = assembler(&runner, tree.path(), FirmwareSetting::Bios);
        assert!(matches!(
            boot.deploy_boot_images("0815", None),
            Err(DiskforgeError::Font(_))
        ));
    }

    #[test]
    fn missing_modules_fail() {
        let tree = source_tree();
        let root = tree.path();
        fs::remove_dir_all(root.join("usr/lib/grub2/i386-pc")).unwrap();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Bios);
        assert!(matches!(
            boot.deploy_boot_images("0815", None),
            Err(DiskforgeError::Modules(_))
        ));
    }

    #[test]
    fn custom_efi_path_is_used_and_remembered() {
        let tree = source_tree();
        let root = tree.path();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Efi);
        let esp = root.join("esp/EFI/BOOT");
        boot.deploy_boot_images("0815", Some(&esp)).unwrap();
        assert!(esp.join("earlyboot.cfg").exists());
        assert_eq!(boot.config().efi_boot_path, Some(esp));
    }

    #[test]
    fn install_images_for_efi() {
        let tree = source_tree();
        let root = tree.path();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Bios);
        boot.deploy_install_images(&DiskSignature::new(0xffffffff))
            .unwrap();

        assert_eq!(
            fs::read_to_string(root.join("EFI/BOOT/earlyboot.cfg")).unwrap(),
            "search --file --set=root /boot/0xffffffff\nset prefix=($root)/boot/grub2\n"
        );
        assert_eq!(
            runner.calls(),
            vec![
                argv(&[
                    "cp",
                    &at(root, "usr/share/grub2/unicode.pf2"),
                    &at(root, "boot/unicode.pf2")
                ]),
                argv(&[
                    "cp",
                    "-a",
                    &at(root, "usr/lib/grub2/x86_64-efi"),
                    &at(root, "boot/grub2/x86_64-efi")
                ]),
                mkimage(
                    root,
                    "x86_64-efi",
                    "EFI/BOOT/bootx64.efi",
                    "EFI/BOOT/earlyboot.cfg",
                    "/boot/grub2"
                ),
                argv(&["qemu-img", "create", &at(root, "boot/x86_64/efi"), "4M"]),
                argv(&["mkdosfs", "-n", "BOOT", &at(root, "boot/x86_64/efi")]),
                argv(&[
                    "mcopy",
                    "-Do",
                    "-s",
                    "-i",
                    &at(root, "boot/x86_64/efi"),
                    &at(root, "EFI"),
                    "::"
                ]),
            ]
        );
    }

    #[test]
    fn install_images_for_secure_boot() {
        let tree = source_tree();
        let root = tree.path();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, root, FirmwareSetting::Uefi);
        boot.deploy_install_images(&DiskSignature::new(0xffffffff))
            .unwrap();

        let calls = runner.calls();
        assert_eq!(
            calls[0],
            argv(&[
                "cp",
                &at(root, "usr/lib64/efi/shim.efi"),
                &at(root, "EFI/BOOT/bootx64.efi")
            ])
        );
        assert_eq!(
            calls[1],
            argv(&["cp", &at(root, "usr/lib64/efi/grub.efi"), &at(root, "EFI/BOOT")])
        );
        assert_eq!(calls.last().unwrap()[0], "mcopy");
    }

    #[test]
    fn install_media_rejects_paravirt() {
        let tree = source_tree();
        let runner = RecordingRunner::new();
        let mut boot = assembler(&runner, tree.path(), FirmwareSetting::Ec2);
        assert!(matches!(
            boot.deploy_install_images(&DiskSignature::new(1)),
            Err(DiskforgeError::UnsupportedMedia(_))
        ));
        assert!(runner.calls().is_empty());
    }
}
