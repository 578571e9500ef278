//! Image description

mod image;

pub use image::*;
