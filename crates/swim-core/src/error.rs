//! Error handling for swimmesh
//!
//! Provides the error and result types used by configuration loading and the
//! other fallible operations shared across swimmesh crates.

/// Result type alias for swimmesh core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for swimmesh core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// The cluster secret is missing; nodes cannot authenticate packets without it
    #[error("Secret unavailable: {0}")]
    SecretUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Layered configuration errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a missing secret error
    pub fn secret_unavailable(msg: impl Into<String>) -> Self {
        Self::SecretUnavailable(msg.into())
    }

    /// Whether this error must stop the process at startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfiguration(_) | Error::SecretUnavailable(_) | Error::Config(_)
        )
    }
}
