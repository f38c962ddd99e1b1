//! pingtun Core
//!
//! Tunnel lifecycle on top of the packet engine:
//! - Configuration store abstraction and a file-backed implementation
//! - Tunnel provider hosting the packet ingest loop
//! - Request-coalescing lifecycle coordinator
//! - Published tunnel state and error broadcast

pub mod config;
pub mod coordinator;
pub mod error;
pub mod provider;
pub mod state;
pub mod store;

pub use config::CoreConfig;
pub use coordinator::{DriveStats, TunnelManager};
pub use error::{CoreError, CoreResult};
pub use provider::TunnelProvider;
pub use state::{TunnelRequest, TunnelState};
pub use store::local::LocalStore;
pub use store::{
    ConfigurationId, ConfigurationStore, ConnectionStatus, ProtocolKind, StatusCallback,
    StatusObservers, Subscription, TunnelConfiguration, TunnelProfile,
};
