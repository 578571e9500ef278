//! Source tree measurement and filesystem-adjusted image sizing

use crate::utils::command::CommandExecutor;
use crate::utils::error::{DiskforgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MIB: u64 = 1024 * 1024;

/// Bytes reserved per inode when sizing ext filesystems
pub const EXT_INODE_SIZE: u64 = 256;

/// Growth factors applied to the requested size
const EXT_FACTOR: f64 = 1.5;
const BTRFS_FACTOR: f64 = 1.5;
const XFS_FACTOR: f64 = 1.2;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemKind {
    Ext2,
    Ext3,
    #[default]
    Ext4,
    Btrfs,
    Xfs,
}

impl FilesystemKind {
    /// ext filesystems preallocate inode tables and need per-entry room
    pub fn is_ext(&self) -> bool {
        matches!(self, Self::Ext2 | Self::Ext3 | Self::Ext4)
    }
}

impl std::fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ext2 => write!(f, "ext2"),
            Self::Ext3 => write!(f, "ext3"),
            Self::Ext4 => write!(f, "ext4"),
            Self::Btrfs => write!(f, "btrfs"),
            Self::Xfs => write!(f, "xfs"),
        }
    }
}

impl std::str::FromStr for FilesystemKind {
    type Err = DiskforgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ext2" => Ok(Self::Ext2),
            "ext3" => Ok(Self::Ext3),
            "ext4" => Ok(Self::Ext4),
            "btrfs" => Ok(Self::Btrfs),
            "xfs" => Ok(Self::Xfs),
            other => Err(DiskforgeError::ValidationError(format!(
                "Unsupported filesystem: {}",
                other
            ))),
        }
    }
}

/// Result of sizing a source tree for a given filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeEstimate {
    pub raw_usage_bytes: u64,
    pub entry_count: u64,
    pub filesystem_kind: FilesystemKind,
    pub result_megabytes: u64,
}

/// Target size in whole megabytes for `requested_mb` of content on `kind`.
///
/// Never smaller than `requested_mb`; for the same inputs ext >= btrfs >= xfs.
/// Fractional megabytes are dropped.
pub fn adjusted_size(requested_mb: u64, kind: FilesystemKind, entry_count: u64) -> u64 {
    let requested = requested_mb as f64;
    let size = match kind {
        FilesystemKind::Ext2 | FilesystemKind::Ext3 | FilesystemKind::Ext4 => {
            let inode_mb = (entry_count * EXT_INODE_SIZE) as f64 / MIB as f64;
            requested * EXT_FACTOR + 2.0 * inode_mb
        }
        FilesystemKind::Btrfs => requested * BTRFS_FACTOR,
        FilesystemKind::Xfs => requested * XFS_FACTOR,
    };
    (size as u64).max(requested_mb)
}

/// Measures a source tree through external tools. Nothing is cached: each
/// call issues a fresh measurement.
pub struct SizeEstimator<'a> {
    source_root: PathBuf,
    cmd: &'a dyn CommandExecutor,
}

impl<'a> SizeEstimator<'a> {
    pub fn new(cmd: &'a dyn CommandExecutor, source_root: impl AsRef<Path>) -> Self {
        Self {
            source_root: source_root.as_ref().to_path_buf(),
            cmd,
        }
    }

    /// Apparent on-disk usage of the tree in bytes
    pub fn measure_usage(&self) -> Result<u64> {
        let root = self.source_root.to_string_lossy();
        let args = ["-s", "--apparent-size", "--block-size", "1", root.as_ref()];
        let output = self.cmd.run("du", &args)?;
        if output.is_empty() && self.cmd.is_dry_run() {
            return Ok(0);
        }
        let bytes = parse_count("du", output.split_whitespace().next().unwrap_or(""))?;
        debug!("{} uses {} bytes", root, bytes);
        Ok(bytes)
    }

    /// Apparent usage rounded down to whole megabytes
    pub fn measure_usage_mbytes(&self) -> Result<u64> {
        Ok(self.measure_usage()? / MIB)
    }

    /// Number of filesystem entries below and including the root
    pub fn measure_entry_count(&self) -> Result<u64> {
        let root = self.source_root.to_string_lossy();
        let quoted = shlex::try_quote(root.as_ref()).map_err(|e| {
            DiskforgeError::ValidationError(format!("Cannot quote path {}: {}", root, e))
        })?;
        let script = format!("find {} | wc -l", quoted);
        let output = self.cmd.run("bash", &["-c", &script])?;
        if output.is_empty() && self.cmd.is_dry_run() {
            return Ok(0);
        }
        let count = parse_count("wc", output.trim())?;
        debug!("{} holds {} entries", root, count);
        Ok(count)
    }

    /// `requested_mb` grown by the overhead `kind` needs for this tree
    pub fn size_for(&self, requested_mb: u64, kind: FilesystemKind) -> Result<u64> {
        let entry_count = if kind.is_ext() {
            self.measure_entry_count()?
        } else {
            0
        };
        Ok(adjusted_size(requested_mb, kind, entry_count))
    }

    /// Measure the tree and size an image for it in one pass
    pub fn estimate(&self, requested_mb: u64, kind: FilesystemKind) -> Result<SizeEstimate> {
        let raw_usage_bytes = self.measure_usage()?;
        let entry_count = self.measure_entry_count()?;
        let result_megabytes = adjusted_size(requested_mb, kind, entry_count);

        info!(
            "Sized {} for {}: {}MB requested, {}MB target",
            self.source_root.display(),
            kind,
            requested_mb,
            result_megabytes
        );

        Ok(SizeEstimate {
            raw_usage_bytes,
            entry_count,
            filesystem_kind: kind,
            result_megabytes,
        })
    }
}

fn parse_count(command: &str, text: &str) -> Result<u64> {
    text.parse().map_err(|_| DiskforgeError::Measurement {
        command: command.to_string(),
        output: text.to_string(),
    })
}
