//! Error types for the Turnstile crate.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// The counting path never produces one of these: a rate-limit check always
/// yields a decision. Errors only come out of configuration and lookups.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy definition that cannot be turned into a limiter
    #[error("Invalid policy '{policy}': {reason}")]
    InvalidPolicy { policy: String, reason: String },

    /// Lookup of a policy name that is not registered
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for TurnstileError {
    fn from(err: ::config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
