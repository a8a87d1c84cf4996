//! Error types for the infrastructure layer.

use thiserror::Error;

/// Errors produced by infrastructure components.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration key was requested that has no value and no default.
    #[error("missing configuration key: {0}")]
    MissingConfig(String),

    /// A configuration value could not be parsed as the requested type.
    #[error("invalid configuration value for {key}: {value:?}")]
    InvalidConfig { key: String, value: String },

    /// Logging could not be initialized.
    #[error("logging setup failed: {0}")]
    LoggingSetup(String),
}

pub type Result<T> = std::result::Result<T, Error>;
