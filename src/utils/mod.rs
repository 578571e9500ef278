//! Shared utilities

pub mod command;
pub mod error;

#[cfg(test)]
pub(crate) mod log_capture;
