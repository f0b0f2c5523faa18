//! Error types for commit-miner.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for commit-miner.
#[derive(Error, Debug)]
pub enum MinerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid pattern on row {row} of {}: {source}", file.display())]
    Pattern {
        file: PathBuf,
        row: usize,
        #[source]
        source: regex::Error,
    },

    #[error("Pattern file {} contains no patterns", .0.display())]
    EmptyPatternSet(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Required file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Transfer to/from {node} failed: {message}")]
    Transfer { node: String, message: String },

    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("Remote '{0}' is not configured in the repository")]
    UnknownRemote(String),
}

impl From<toml::de::Error> for MinerError {
    fn from(err: toml::de::Error) -> Self {
        MinerError::Config(err.to_string())
    }
}

/// Result type alias for commit-miner operations.
pub type Result<T> = std::result::Result<T, MinerError>;
