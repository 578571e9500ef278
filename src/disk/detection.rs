//! Target disk identification

use crate::utils::command::CommandExecutor;
use crate::utils::error::{DiskforgeError, Result};
use std::path::Path;

/// Provides the block device a partition table is written to
pub trait DiskDevice {
    fn device_path(&self) -> &str;
}

/// A block device (or loop-mounted image) named by path
#[derive(Debug, Clone)]
pub struct TargetDisk {
    path: String,
}

impl TargetDisk {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Open a device that must already exist
    pub fn open(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Err(DiskforgeError::ValidationError(format!(
                "Device not found: {}",
                path
            )));
        }
        Ok(Self::new(path))
    }
}

impl DiskDevice for TargetDisk {
    fn device_path(&self) -> &str {
        &self.path
    }
}

/// Get the partition naming prefix for a device
/// e.g., /dev/sda -> /dev/sda, /dev/nvme0n1 -> /dev/nvme0n1p
pub fn partition_prefix(device: &str) -> String {
    if device.contains("nvme") || device.contains("mmcblk") || device.contains("loop") {
        format!("{}p", device)
    } else {
        device.to_string()
    }
}

/// Get partition path for a device and partition number
pub fn partition_path(device: &str, partition_num: u32) -> String {
    format!("{}{}", partition_prefix(device), partition_num)
}

/// Filesystem UUID of a formatted partition
pub fn filesystem_uuid(cmd: &dyn CommandExecutor, partition: &str) -> Result<String> {
    let uuid = cmd.run("blkid", &["-s", "UUID", "-o", "value", partition])?;
    if uuid.is_empty() && !cmd.is_dry_run() {
        return Err(DiskforgeError::ValidationError(format!(
            "No filesystem UUID on {}",
            partition
        )));
    }
    Ok(uuid)
}
