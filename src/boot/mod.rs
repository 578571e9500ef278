//! Bootloader assembly: firmware resolution, GRUB templates and images

pub mod firmware;
pub mod grub;
pub mod signature;
pub mod template;
