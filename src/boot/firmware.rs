//! Firmware, hypervisor and architecture capabilities of the target

use crate::utils::error::{DiskforgeError, Result};
use serde::{Deserialize, Serialize};

/// EFI support reported by a firmware probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EfiMode {
    None,
    Efi,
    SecureEfi,
}

/// Hypervisor support reported by a firmware probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorMode {
    None,
    Guest,
}

/// Role of the target inside a paravirtualized hypervisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HypervisorDomain {
    #[serde(rename = "dom0")]
    Privileged,
    #[serde(rename = "domU")]
    Unprivileged,
    #[default]
    #[serde(rename = "none")]
    None,
}

pub trait FirmwareProbe {
    fn efi_mode(&self) -> EfiMode;
    fn hypervisor_mode(&self) -> HypervisorMode;
}

pub trait DomainProbe {
    fn hypervisor_domain(&self) -> HypervisorDomain;
}

/// Firmware the image is built for, as named in an image description
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareSetting {
    #[default]
    Bios,
    Efi,
    /// EFI with secure boot
    Uefi,
    /// Paravirtualized cloud guest
    Ec2,
}

/// Probe answers taken from the image description instead of the build host
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredFirmware {
    pub firmware: FirmwareSetting,
    pub domain: HypervisorDomain,
}

impl FirmwareProbe for ConfiguredFirmware {
    fn efi_mode(&self) -> EfiMode {
        match self.firmware {
            FirmwareSetting::Efi => EfiMode::Efi,
            FirmwareSetting::Uefi => EfiMode::SecureEfi,
            FirmwareSetting::Bios | FirmwareSetting::Ec2 => EfiMode::None,
        }
    }

    fn hypervisor_mode(&self) -> HypervisorMode {
        match self.firmware {
            FirmwareSetting::Ec2 => HypervisorMode::Guest,
            _ => HypervisorMode::None,
        }
    }
}

impl DomainProbe for ConfiguredFirmware {
    fn hypervisor_domain(&self) -> HypervisorDomain {
        self.domain
    }
}

/// The single firmware family a boot assembly targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareMode {
    Bios,
    Efi,
    EfiSecure,
    HypervisorParavirt,
}

impl FirmwareMode {
    /// Secure EFI wins over plain EFI, EFI over a paravirt guest, and BIOS
    /// is the fallback.
    pub fn resolve(probe: &dyn FirmwareProbe) -> Self {
        match (probe.efi_mode(), probe.hypervisor_mode()) {
            (EfiMode::SecureEfi, _) => Self::EfiSecure,
            (EfiMode::Efi, _) => Self::Efi,
            (EfiMode::None, HypervisorMode::Guest) => Self::HypervisorParavirt,
            (EfiMode::None, HypervisorMode::None) => Self::Bios,
        }
    }

    pub fn is_efi(&self) -> bool {
        matches!(self, Self::Efi | Self::EfiSecure)
    }
}

impl std::fmt::Display for FirmwareMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bios => write!(f, "bios"),
            Self::Efi => write!(f, "efi"),
            Self::EfiSecure => write!(f, "efi-secure"),
            Self::HypervisorParavirt => write!(f, "hypervisor-paravirt"),
        }
    }
}

/// Architectures GRUB images can be assembled for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    Ix86,
    Aarch64,
}

impl Architecture {
    /// Map a `uname -m` style machine name
    pub fn from_machine(machine: &str) -> Result<Self> {
        match machine {
            "x86_64" => Ok(Self::X86_64),
            "i686" | "i586" => Ok(Self::Ix86),
            "aarch64" | "arm64" => Ok(Self::Aarch64),
            other => Err(DiskforgeError::Platform(format!(
                "no GRUB support for architecture {}",
                other
            ))),
        }
    }

    /// Directory name used below /boot for install media artifacts
    pub fn machine(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Ix86 => "ix86",
            Self::Aarch64 => "aarch64",
        }
    }

    pub fn bios_target(&self) -> Option<&'static str> {
        match self {
            Self::X86_64 | Self::Ix86 => Some("i386-pc"),
            Self::Aarch64 => None,
        }
    }

    pub fn efi_target(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64-efi",
            Self::Ix86 => "i386-efi",
            Self::Aarch64 => "arm64-efi",
        }
    }

    pub fn paravirt_target(&self) -> Option<&'static str> {
        match self {
            Self::X86_64 => Some("x86_64-xen"),
            Self::Ix86 => Some("i386-xen"),
            Self::Aarch64 => None,
        }
    }

    /// Removable-media file name firmware looks for in EFI/BOOT
    pub fn efi_image_name(&self) -> &'static str {
        match self {
            Self::X86_64 => "bootx64.efi",
            Self::Ix86 => "bootia32.efi",
            Self::Aarch64 => "bootaa64.efi",
        }
    }

    /// Whether this architecture can serve `mode` at all
    pub fn supports(&self, mode: FirmwareMode) -> bool {
        match mode {
            FirmwareMode::Bios => self.bios_target().is_some(),
            FirmwareMode::Efi => true,
            FirmwareMode::EfiSecure => matches!(self, Self::X86_64 | Self::Aarch64),
            FirmwareMode::HypervisorParavirt => self.paravirt_target().is_some(),
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.machine())
    }
}
