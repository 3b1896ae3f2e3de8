//! Error types for the execution gateway

use thiserror::Error;

/// Main error type for the execution gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transport could not be established or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failed (key rejected, key unusable)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Command execution timed out
    #[error("Command timed out after {0}ms")]
    CommandTimedOut(u64),

    /// The OS refused to run the command (EACCES)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The command could not be started
    #[error("Execution error: {0}")]
    Exec(String),

    /// Invalid parameters provided
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// SFTP subsystem error
    #[error("SFTP error: {0}")]
    Sftp(String),

    /// AWS Systems Manager API error
    #[error("SSM error: {0}")]
    Ssm(String),

    /// Operation not available on this backend
    #[error("Operation not supported by {backend} handler: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: String,
    },

    /// A retried operation failed on every attempt
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<GatewayError>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Create a connection error from a string
    pub fn connection(msg: impl Into<String>) -> Self {
        GatewayError::Connection(msg.into())
    }

    /// Create an authentication error from a string
    pub fn auth(msg: impl Into<String>) -> Self {
        GatewayError::Authentication(msg.into())
    }

    /// Create an invalid params error from a string
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        GatewayError::InvalidParams(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }

    /// Create an SFTP error from a string
    pub fn sftp(msg: impl Into<String>) -> Self {
        GatewayError::Sftp(msg.into())
    }

    /// Create an SSM error from a string
    pub fn ssm(msg: impl Into<String>) -> Self {
        GatewayError::Ssm(msg.into())
    }

    /// Whether a retry may succeed where this attempt failed.
    ///
    /// Only transport-level failures qualify. Timeouts, permission problems
    /// and configuration mistakes fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Connection(_)
                | GatewayError::Authentication(_)
                | GatewayError::Sftp(_)
                | GatewayError::Ssm(_)
        )
    }
}
