//! Core errors

use thiserror::Error;

use crate::store::ConfigurationId;

/// Core errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration store failure
    #[error("Configuration store error: {0}")]
    Store(String),

    /// A configuration was saved but could not be loaded back
    #[error("Tunnel configuration could not be created")]
    TunnelCreationFailure,

    /// The configuration no longer exists in the store
    #[error("Configuration {0} is invalid")]
    InvalidConfiguration(ConfigurationId),

    /// The configuration is disabled
    #[error("Configuration {0} is disabled")]
    ConfigurationDisabled(ConfigurationId),

    /// The tunnel could not be started
    #[error("Failed to start tunnel: {0}")]
    StartFailed(String),

    /// Invalid settings
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("Network error: {0}")]
    NetworkError(#[from] pingtun_network::NetworkError),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
