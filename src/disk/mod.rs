//! Disk management modules

pub mod detection;
pub mod partitioning;
pub mod size;
