//! Error types for pushgate.

use thiserror::Error;

/// Main error type for pushgate operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading or parsing error.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Device token is not 32 bytes of hex.
    #[error("Invalid device token: {0}")]
    TokenFormat(String),

    /// Payload exceeds the gateway limit.
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Maximum accepted payload size.
        max: usize,
    },

    /// Bytes read from the gateway are not a valid error-response frame.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Transport or TLS session failure talking to the gateway.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Client identity or TLS configuration could not be built.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Caller supplied an unusable argument.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Metrics registry error.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Returns true for transport failures that the dispatcher may retry.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
