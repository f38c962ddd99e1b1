//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TUN device error
    #[error("TUN device error: {0}")]
    TunError(String),

    /// The packet flow has been closed
    #[error("Packet flow closed")]
    FlowClosed,

    /// Platform not supported
    #[error("Platform not supported for this operation")]
    PlatformNotSupported,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
