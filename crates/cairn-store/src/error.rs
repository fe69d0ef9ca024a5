//! Error types for the exit-workflow store.

use std::path::PathBuf;

use thiserror::Error;

/// Exit-workflow store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// State file parse error.
    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// TOML serialization error.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Row not found.
    #[error("row not found: {0}")]
    NotFound(String),

    /// State lock poisoned by a panicking writer.
    #[error("store state lock poisoned")]
    Poisoned,
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
