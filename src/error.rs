//! Error types for block script execution

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BlockError>;

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Execution stopped by user")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Pattern error: {0}")]
    Regex(#[from] regex::Error),
}

impl BlockError {
    /// Whether this error ends the whole script run
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BlockError::Cancelled)
    }
}
