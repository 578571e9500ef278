//! GPT partition creation through sgdisk

use crate::disk::detection::DiskDevice;
use crate::utils::command::CommandExecutor;
use crate::utils::error::{DiskforgeError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};

/// Partition table formats a builder can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTable {
    Gpt,
}

impl std::fmt::Display for PartitionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gpt => write!(f, "gpt"),
        }
    }
}

/// Requested partition size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSize {
    /// Fixed size in megabytes
    Megabytes(u64),
    /// Everything left on the disk
    AllRemaining,
}

impl PartitionSize {
    /// End field of `sgdisk -n`
    fn sgdisk_end(&self) -> String {
        match self {
            Self::Megabytes(mb) => format!("+{}M", mb),
            Self::AllRemaining => "0".to_string(),
        }
    }
}

impl std::fmt::Display for PartitionSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Megabytes(mb) => write!(f, "{}MB", mb),
            Self::AllRemaining => write!(f, "all"),
        }
    }
}

impl Serialize for PartitionSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Megabytes(mb) => serializer.serialize_u64(*mb),
            Self::AllRemaining => serializer.serialize_str("all"),
        }
    }
}

impl<'de> Deserialize<'de> for PartitionSize {
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
            Raw::Megabytes(mb) => Ok(Self::Megabytes(mb)),
            Raw::Keyword(k) if k == "all" => Ok(Self::AllRemaining),
            Raw::Keyword(k) => Err(serde::de::Error::custom(format!(
                "invalid partition size '{}', expected megabytes or \"all\"",
                k
            ))),
        }
    }
}

/// Semantic partition flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionFlag {
    /// Legacy "active" marker, meaningless on GPT
    Active,
    /// BIOS boot partition for GRUB's core image
    Csm,
    Linux,
    Lvm,
    Raid,
    Efi,
    Swap,
    /// PowerPC PReP boot
    Prep,
}

impl PartitionFlag {
    pub const ALL: [PartitionFlag; 8] = [
        Self::Active,
        Self::Csm,
        Self::Linux,
        Self::Lvm,
        Self::Raid,
        Self::Efi,
        Self::Swap,
        Self::Prep,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "f.active",
            Self::Csm => "t.csm",
            Self::Linux => "t.linux",
            Self::Lvm => "t.lvm",
            Self::Raid => "t.raid",
            Self::Efi => "t.efi",
            Self::Swap => "t.swap",
            Self::Prep => "t.prep",
        }
    }

    /// GPT type code, or None when GPT has no equivalent
    pub fn gpt_type_code(&self) -> Option<&'static str> {
        match self {
            Self::Active => None,
            Self::Csm => Some("EF02"),
            Self::Linux => Some("8300"),
            Self::Lvm => Some("8E00"),
            Self::Raid => Some("FD00"),
            Self::Efi => Some("EF00"),
            Self::Swap => Some("8200"),
            Self::Prep => Some("4100"),
        }
    }
}

impl std::fmt::Display for PartitionFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for PartitionFlag {
    type Err = DiskforgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|flag| flag.name() == s)
            .ok_or_else(|| DiskforgeError::Flag(s.to_string()))
    }
}

impl Serialize for PartitionFlag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for PartitionFlag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Builds a GPT on one disk. Partition numbers are handed out sequentially
/// per builder, starting at 1, and never reused.
pub struct GptPartitioner<'a> {
    cmd: &'a dyn CommandExecutor,
    device: String,
    partition_id: u32,
}

impl<'a> GptPartitioner<'a> {
    pub fn new(cmd: &'a dyn CommandExecutor, disk: &dyn DiskDevice) -> Self {
        Self {
            cmd,
            device: disk.device_path().to_string(),
            partition_id: 0,
        }
    }

    pub fn table_kind(&self) -> PartitionTable {
        PartitionTable::Gpt
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Create the next partition and apply `type_flag`, then each of `flags`
    /// in the given order. Returns the partition number.
    pub fn create(
        &mut self,
        name: &str,
        size: PartitionSize,
        type_flag: PartitionFlag,
        flags: &[PartitionFlag],
    ) -> Result<u32> {
        self.partition_id += 1;
        let number = self.partition_id;
        info!(
            "Creating partition {} ({}, {}) on {}",
            number, name, size, self.device
        );

        let new_spec = format!("{}:0:{}", number, size.sgdisk_end());
        let name_spec = format!("{}:{}", number, name);
        self.cmd.run(
            "sgdisk",
            &["-n", &new_spec, "-c", &name_spec, &self.device],
        )?;

        self.set_flag(number, type_flag)?;
        for flag in flags {
            self.set_flag(number, *flag)?;
        }
        Ok(number)
    }

    /// Apply a flag to partition `number`
    pub fn set_flag(&self, number: u32, flag: PartitionFlag) -> Result<()> {
        match flag.gpt_type_code() {
            Some(code) => {
                let type_spec = format!("{}:{}", number, code);
                self.cmd.run("sgdisk", &["-t", &type_spec, &self.device])?;
            }
            None => {
                warn!(
                    "Flag {} has no GPT equivalent, ignored for partition {}",
                    flag, number
                );
            }
        }
        Ok(())
    }

    /// Parse a flag name and apply it
    pub fn set_flag_by_name(&self, number: u32, name: &str) -> Result<()> {
        self.set_flag(number, name.parse()?)
    }
}
