//! Settings error types.

use thiserror::Error;

/// Errors that can occur while loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A required environment variable was absent or empty.
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),
    /// `SUBGRAPHS` could not be turned into a list of upstream descriptors.
    #[error("invalid SUBGRAPHS configuration: {0}")]
    InvalidSubgraphs(String),
    /// A settings value was invalid (e.g., out of range).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
