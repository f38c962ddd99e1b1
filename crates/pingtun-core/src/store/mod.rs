//! Tunnel configuration store
//!
//! A store persists tunnel profiles and exposes each one as a
//! [`TunnelConfiguration`] with a live connection status. Status changes are
//! delivered to callbacks registered per configuration identity.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::CoreResult;

pub mod local;

#[cfg(test)]
pub(crate) mod mock;

/// Identity of a stored configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationId(pub u64);

impl fmt::Display for ConfigurationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Live status of a tunnel connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// The configuration does not exist (anymore)
    Invalid,
    Disconnected,
    Connecting,
    Connected,
    /// Re-establishing after a network change
    Reasserting,
    Disconnecting,
}

impl ConnectionStatus {
    /// Statuses expected to change without further input
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting | Self::Reasserting)
    }
}

/// Kind of protocol a stored configuration drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    /// Hosted by a packet tunnel provider
    PacketTunnel,
    /// Anything else found in the store
    Other,
}

/// Persisted description of a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelProfile {
    pub description: String,
    pub provider_id: String,
    pub server_address: String,
    pub protocol: ProtocolKind,
    pub enabled: bool,
}

/// A configuration loaded from a store
pub trait TunnelConfiguration: Send + Sync {
    fn id(&self) -> ConfigurationId;

    fn profile(&self) -> TunnelProfile;

    /// Current live status
    fn status(&self) -> ConnectionStatus;

    /// Request the tunnel to start; completion is reported through status changes
    fn start(&self) -> CoreResult<()>;

    /// Request the tunnel to stop
    fn stop(&self);
}

/// Persistence and status notifications for tunnel configurations
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    /// Load every stored configuration
    async fn load_all(&self) -> CoreResult<Vec<Arc<dyn TunnelConfiguration>>>;

    /// Persist a new configuration
    async fn save(&self, profile: &TunnelProfile) -> CoreResult<()>;

    /// Remove a configuration; its status becomes [`ConnectionStatus::Invalid`]
    async fn remove(&self, id: ConfigurationId) -> CoreResult<()>;

    /// Observe status changes of one configuration until the handle is dropped
    fn subscribe(&self, id: ConfigurationId, callback: StatusCallback) -> Subscription;
}

/// Status change callback
pub type StatusCallback = Arc<dyn Fn(ConfigurationId, ConnectionStatus) + Send + Sync>;

/// Unsubscribe handle; dropping it unsubscribes
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

struct Observer {
    token: u64,
    id: ConfigurationId,
    callback: StatusCallback,
}

/// Registry of status callbacks keyed by configuration identity
#[derive(Default)]
pub struct StatusObservers {
    next_token: AtomicU64,
    observers: Mutex<Vec<Observer>>,
}

impl StatusObservers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `callback` for `id`
    pub fn subscribe(self: &Arc<Self>, id: ConfigurationId, callback: StatusCallback) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Observer {
            token,
            id,
            callback,
        });

        let registry: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.lock().retain(|observer| observer.token != token);
            }
        })
    }

    /// Deliver a status change to every observer of `id`.
    ///
    /// Callbacks run outside the registry lock.
    pub fn notify(&self, id: ConfigurationId, status: ConnectionStatus) {
        let callbacks: Vec<StatusCallback> = self
            .lock()
            .iter()
            .filter(|observer| observer.id == id)
            .map(|observer| Arc::clone(&observer.callback))
            .collect();

        trace!("Status of {} is now {:?} ({} observers)", id, status, callbacks.len());
        for callback in callbacks {
            callback(id, status);
        }
    }

    /// Number of observers registered for `id`
    pub fn count(&self, id: ConfigurationId) -> usize {
        self.lock().iter().filter(|observer| observer.id == id).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Observer>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
