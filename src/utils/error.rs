//! Error types for Diskforge

use thiserror::Error;

/// Failures raised while rendering a bootloader template.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("no substitution value for placeholder '{0}'")]
    MissingKey(String),

    #[error("unterminated placeholder at offset {0}")]
    UnterminatedPlaceholder(usize),
}

#[derive(Error, Debug)]
pub enum DiskforgeError {
    #[error("Must be run as root")]
    NotRoot,

    #[error("Unsupported platform: {0}")]
    Platform(String),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Secure boot setup failed: {0}")]
    SecureBoot(String),

    #[error("Boot font setup failed: {0}")]
    Font(String),

    #[error("Boot module setup failed: {0}")]
    Modules(String),

    #[error("Unknown partition flag: {0}")]
    Flag(String),

    #[error("Unsupported boot media: {0}")]
    UnsupportedMedia(String),

    #[error("No rendered bootloader configuration to write")]
    ConfigNotRendered,

    #[error("Unexpected output from {command}: {output:?}")]
    Measurement { command: String, output: String },

    #[error("Command failed: {command}\n{stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Nix error: {0}")]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, DiskforgeError>;
