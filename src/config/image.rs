//! Image description loaded from TOML

use crate::boot::firmware::{ConfiguredFirmware, FirmwareSetting, HypervisorDomain};
use crate::boot::grub::{BootSettings, MediaKind};
use crate::disk::partitioning::{PartitionFlag, PartitionSize};
use crate::disk::size::FilesystemKind;
use crate::utils::error::{DiskforgeError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;

/// Main image configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Unpacked root tree the image is built from
    pub source_root: String,
    pub disk: DiskConfig,
    #[serde(default)]
    pub filesystem: FilesystemConfig,
    #[serde(default)]
    pub bootloader: BootloaderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Target device path (e.g., /dev/loop0)
    pub device: String,
    /// Partitions in creation order
    pub partitions: Vec<PartitionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub name: String,
    /// Megabytes, "all" for the rest of the disk, or "auto" for the
    /// estimated size of the source tree
    pub size: SizeSetting,
    pub type_flag: PartitionFlag,
    #[serde(default)]
    pub flags: Vec<PartitionFlag>,
}

/// Partition size as written in the image description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSetting {
    Fixed(PartitionSize),
    /// Filled in from the source tree size estimate
    Auto,
}

impl SizeSetting {
    /// Concrete size, with `Auto` taken from `estimate_mb`
    pub fn resolve(&self, estimate_mb: Option<u64>) -> Result<PartitionSize> {
        match (self, estimate_mb) {
            (Self::Fixed(size), _) => Ok(*size),
            (Self::Auto, Some(mb)) => Ok(PartitionSize::Megabytes(mb.max(1))),
            (Self::Auto, None) => Err(DiskforgeError::ConfigError(
                "partition size \"auto\" needs a size estimate".to_string(),
            )),
        }
    }
}

impl From<PartitionSize> for SizeSetting {
    fn from(size: PartitionSize) -> Self {
        Self::Fixed(size)
    }
}

impl Serialize for SizeSetting {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Fixed(size) => size.serialize(serializer),
            Self::Auto => serializer.serialize_str("auto"),
        }
    }
}

impl<'de> Deserialize<'de> for SizeSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Megabytes(u64),
            Keyword(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Megabytes(0) => Err(serde::de::Error::custom(
                "partition size must be positive",
            )),
            Raw::Megabytes(mb) => Ok(Self::Fixed(PartitionSize::Megabytes(mb))),
            Raw::Keyword(k) if k == "all" => Ok(Self::Fixed(PartitionSize::AllRemaining)),
            Raw::Keyword(k) if k == "auto" => Ok(Self::Auto),
            Raw::Keyword(k) => Err(serde::de::Error::custom(format!(
                "invalid partition size '{}', expected megabytes, \"all\" or \"auto\"",
                k
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesystemConfig {
    #[serde(default)]
    pub kind: FilesystemKind,
    /// Content size in MB; the measured tree size when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootloaderConfig {
    #[serde(default)]
    pub media: MediaKind,
    #[serde(default)]
    pub firmware: FirmwareSetting,
    #[serde(default)]
    pub domain: HypervisorDomain,
    /// `uname -m` style name; the build host when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<String>,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_timeout")]
    pub timeout: u32,
    #[serde(default = "default_kernel")]
    pub kernel: String,
    #[serde(default = "default_initrd")]
    pub initrd: String,
    #[serde(default = "default_cmdline")]
    pub cmdline: String,
    #[serde(default = "default_true")]
    pub failsafe: bool,
    #[serde(default)]
    pub separate_boot_partition: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi_boot_path: Option<String>,
    /// Inline grub.cfg template replacing the built-in ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_template: Option<String>,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            media: MediaKind::default(),
            firmware: FirmwareSetting::default(),
            domain: HypervisorDomain::default(),
            machine: None,
            terminal: None,
            title: default_title(),
            timeout: default_timeout(),
            kernel: default_kernel(),
            initrd: default_initrd(),
            cmdline: default_cmdline(),
            failsafe: true,
            separate_boot_partition: false,
            efi_boot_path: None,
            custom_template: None,
        }
    }
}

// Default value functions

fn default_title() -> String {
    "Linux Appliance".to_string()
}

fn default_timeout() -> u32 {
    10
}

fn default_kernel() -> String {
    "vmlinuz".to_string()
}

fn default_initrd() -> String {
    "initrd".to_string()
}

fn default_cmdline() -> String {
    "quiet".to_string()
}

fn default_true() -> bool {
    true
}

impl ImageConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ImageConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        ImageConfig {
            source_root: "/var/tmp/appliance/root".to_string(),
            disk: DiskConfig {
                device: "/dev/loop0".to_string(),
                partitions: vec![
                    PartitionConfig {
                        name: "p.legacy".to_string(),
                        size: PartitionSize::Megabytes(2).into(),
                        type_flag: PartitionFlag::Csm,
                        flags: Vec::new(),
                    },
                    PartitionConfig {
                        name: "p.UEFI".to_string(),
                        size: PartitionSize::Megabytes(200).into(),
                        type_flag: PartitionFlag::Efi,
                        flags: Vec::new(),
                    },
                    PartitionConfig {
                        name: "p.lxroot".to_string(),
                        size: SizeSetting::Auto,
                        type_flag: PartitionFlag::Linux,
                        flags: Vec::new(),
                    },
                ],
            },
            filesystem: FilesystemConfig {
                kind: FilesystemKind::Ext4,
                requested_mb: None,
            },
            bootloader: BootloaderConfig {
                firmware: FirmwareSetting::Efi,
                ..BootloaderConfig::default()
            },
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.source_root.is_empty() {
            return Err(DiskforgeError::ValidationError(
                "Source root cannot be empty".to_string(),
            ));
        }

        if self.disk.device.is_empty() {
            return Err(DiskforgeError::ValidationError(
                "Disk device cannot be empty".to_string(),
            ));
        }

        if self.disk.partitions.is_empty() {
            return Err(DiskforgeError::ValidationError(
                "At least one partition is required".to_string(),
            ));
        }

        let last = self.disk.partitions.len() - 1;
        for (idx, part) in self.disk.partitions.iter().enumerate() {
            if part.name.is_empty() || part.name.contains(char::is_whitespace) {
                return Err(DiskforgeError::ValidationError(format!(
                    "Invalid partition name '{}'",
                    part.name
                )));
            }
            if part.size == SizeSetting::Fixed(PartitionSize::AllRemaining) && idx != last {
                return Err(DiskforgeError::ValidationError(format!(
                    "Only the last partition may use all remaining space, not '{}'",
                    part.name
                )));
            }
        }

        let auto_count = self
            .disk
            .partitions
            .iter()
            .filter(|p| p.size == SizeSetting::Auto)
            .count();
        if auto_count > 1 {
            return Err(DiskforgeError::ValidationError(
                "Only one partition may be sized \"auto\"".to_string(),
            ));
        }

        if self.bootloader.title.is_empty() {
            return Err(DiskforgeError::ValidationError(
                "Boot menu title cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether partitioning needs a size estimate of the source tree
    pub fn needs_estimate(&self) -> bool {
        self.disk
            .partitions
            .iter()
            .any(|p| p.size == SizeSetting::Auto)
    }

    /// Partition sizes in creation order, with "auto" resolved
    pub fn partition_sizes(&self, estimate_mb: Option<u64>) -> Result<Vec<PartitionSize>> {
        self.disk
            .partitions
            .iter()
            .map(|p| p.size.resolve(estimate_mb))
            .collect()
    }

    /// Menu and layout settings for the boot assembler
    pub fn boot_settings(&self) -> BootSettings {
        let boot = &self.bootloader;
        BootSettings {
            title: boot.title.clone(),
            timeout: boot.timeout,
            kernel: boot.kernel.clone(),
            initrd: boot.initrd.clone(),
            cmdline: boot.cmdline.clone(),
            terminal: boot.terminal.clone(),
            failsafe: boot.failsafe,
            separate_boot_partition: boot.separate_boot_partition,
            custom_template: boot.custom_template.clone(),
            ..BootSettings::default()
        }
    }

    /// Firmware and hypervisor domain the image targets
    pub fn firmware(&self) -> ConfiguredFirmware {
        ConfiguredFirmware {
            firmware: self.bootloader.firmware,
            domain: self.bootloader.domain,
        }
    }

    /// Machine name the boot images are built for
    pub fn machine(&self) -> &str {
        self.bootloader
            .machine
            .as_deref()
            .unwrap_or(std::env::consts::ARCH)
    }

    pub fn efi_boot_path(&self) -> Option<PathBuf> {
        self.bootloader.efi_boot_path.as_ref().map(PathBuf::from)
    }
}
