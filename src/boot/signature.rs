//! Disk signatures used by install media to find their root device

use crate::utils::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Supplies the identifier early boot searches for
pub trait DiskSignatureProvider {
    fn id(&self) -> String;
}

/// A 32-bit disk signature, rendered as `0x%08x`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSignature(u32);

impl DiskSignature {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Random non-zero signature
    pub fn generate() -> Self {
        let bits = Uuid::new_v4().as_u128();
        Self((bits as u32).max(1))
    }

    /// Path of the marker file inside a root tree
    pub fn marker_path(&self, source_root: &Path) -> PathBuf {
        source_root.join("boot").join(self.id())
    }

    /// Write the marker file that `search --file` locates at boot time
    pub fn write_marker(&self, source_root: &Path) -> Result<PathBuf> {
        let path = self.marker_path(source_root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{}\n", self.id()))?;
        fs::write(source_root.join("boot").join("mbrid"), format!("{}\n", self.id()))?;
        info!("Wrote disk signature {} to {}", self.id(), path.display());
        Ok(path)
    }
}

impl DiskSignatureProvider for DiskSignature {
    fn id(&self) -> String {
        format!("{:#010x}", self.0)
    }
}

impl std::fmt::Display for DiskSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}
