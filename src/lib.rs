//! Diskforge library - disk and boot assembly for Linux appliance images

pub mod boot;
pub mod config;
pub mod disk;
pub mod utils;

pub use boot::grub::BootAssembler;
pub use config::ImageConfig;
pub use disk::partitioning::GptPartitioner;
pub use disk::size::SizeEstimator;
pub use utils::error::DiskforgeError;
