//! Common error types for qmap

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for qmap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across qmap crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML document could not be parsed
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML document could not be serialized
    #[error("TOML write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    /// JSON document could not be parsed or serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another process holds the run lock
    #[error("Lock {path} is held by another run ({holder})")]
    Locked { path: PathBuf, holder: String },

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
