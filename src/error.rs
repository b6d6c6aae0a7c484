//! Error types for the Turnstile service.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid configuration values (zero limits, zero windows, bad rules)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure while assembling configuration sources
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// A rate limit key was empty
    #[error("rate limit key must not be empty")]
    EmptyKey,

    /// A caller sent a malformed rate limit request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether the error was caused by the caller's input rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TurnstileError::EmptyKey | TurnstileError::InvalidRequest(_)
        )
    }
}

impl From<TurnstileError> for tonic::Status {
    fn from(err: TurnstileError) -> Self {
        if err.is_client_error() {
            tonic::Status::invalid_argument(err.to_string())
        } else {
            tonic::Status::internal(err.to_string())
        }
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
