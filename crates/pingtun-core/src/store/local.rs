//! File-backed configuration store
//!
//! Profiles live in a TOML file. Each loaded configuration hosts its own
//! [`TunnelProvider`]; starting and stopping it drives the status changes
//! observers see.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use pingtun_network::{FlowFactory, TunConfig};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{
    ConfigurationId, ConfigurationStore, ConnectionStatus, StatusCallback, StatusObservers,
    Subscription, TunnelConfiguration, TunnelProfile,
};
use crate::error::{CoreError, CoreResult};
use crate::provider::TunnelProvider;

/// On-disk layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    configurations: Vec<StoredConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredConfiguration {
    id: ConfigurationId,
    profile: TunnelProfile,
}

/// Status shared between a configuration and its background tasks
struct StatusCell {
    id: ConfigurationId,
    status: Mutex<ConnectionStatus>,
    observers: Arc<StatusObservers>,
}

impl StatusCell {
    fn get(&self) -> ConnectionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, status: ConnectionStatus) {
        self.update(|_| true, status);
    }

    /// Set `status` only if the current one is `expected`
    fn set_if(&self, expected: ConnectionStatus, status: ConnectionStatus) -> bool {
        self.update(|current| current == expected, status)
    }

    fn update(&self, allowed: impl Fn(ConnectionStatus) -> bool, status: ConnectionStatus) -> bool {
        {
            let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if !allowed(*current) {
                return false;
            }
            if *current == status {
                return true;
            }
            debug!("Configuration {}: {:?} -> {:?}", self.id, *current, status);
            *current = status;
        }
        self.observers.notify(self.id, status);
        true
    }
}

/// A stored configuration with its tunnel provider
pub struct LocalConfiguration {
    profile: TunnelProfile,
    cell: Arc<StatusCell>,
    provider: Arc<TunnelProvider>,
}

impl LocalConfiguration {
    /// Mark removed and tear the tunnel down
    fn invalidate(&self) {
        let was_active = matches!(
            self.cell.get(),
            ConnectionStatus::Connecting
                | ConnectionStatus::Connected
                | ConnectionStatus::Reasserting
                | ConnectionStatus::Disconnecting
        );
        self.cell.set(ConnectionStatus::Invalid);

        if was_active {
            if let Ok(runtime) = Handle::try_current() {
                let provider = Arc::clone(&self.provider);
                runtime.spawn(async move { provider.stop_tunnel().await });
            }
        }
    }
}

impl TunnelConfiguration for LocalConfiguration {
    fn id(&self) -> ConfigurationId {
        self.cell.id
    }

    fn profile(&self) -> TunnelProfile {
        self.profile.clone()
    }

    fn status(&self) -> ConnectionStatus {
        self.cell.get()
    }

    fn start(&self) -> CoreResult<()> {
        let id = self.cell.id;
        match self.cell.get() {
            ConnectionStatus::Invalid => return Err(CoreError::InvalidConfiguration(id)),
            _ if !self.profile.enabled => return Err(CoreError::ConfigurationDisabled(id)),
            ConnectionStatus::Connecting
            | ConnectionStatus::Connected
            | ConnectionStatus::Reasserting => return Ok(()),
            ConnectionStatus::Disconnecting => {
                return Err(CoreError::StartFailed(format!(
                    "configuration {} is still disconnecting",
                    id
                )))
            }
            ConnectionStatus::Disconnected => {}
        }

        let runtime = Handle::try_current().map_err(|e| CoreError::StartFailed(e.to_string()))?;
        self.cell.set(ConnectionStatus::Connecting);

        let cell = Arc::clone(&self.cell);
        let provider = Arc::clone(&self.provider);
        runtime.spawn(async move {
            match provider.start_tunnel().await {
                Ok(()) => {
                    if !cell.set_if(ConnectionStatus::Connecting, ConnectionStatus::Connected) {
                        // Stopped or removed while starting
                        provider.stop_tunnel().await;
                    }
                }
                Err(e) => {
                    warn!("Configuration {} failed to start: {}", cell.id, e);
                    cell.set_if(ConnectionStatus::Connecting, ConnectionStatus::Disconnected);
                }
            }
        });

        Ok(())
    }

    fn stop(&self) {
        if !matches!(
            self.cell.get(),
            ConnectionStatus::Connecting | ConnectionStatus::Connected | ConnectionStatus::Reasserting
        ) {
            return;
        }

        self.cell.set(ConnectionStatus::Disconnecting);
        let cell = Arc::clone(&self.cell);
        let provider = Arc::clone(&self.provider);

        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    provider.stop_tunnel().await;
                    cell.set_if(ConnectionStatus::Disconnecting, ConnectionStatus::Disconnected);
                });
            }
            Err(_) => {
                warn!("No runtime to stop configuration {}; marking disconnected", cell.id);
                cell.set(ConnectionStatus::Disconnected);
            }
        }
    }
}

/// Configuration store persisted to a TOML file
pub struct LocalStore {
    path: PathBuf,
    tun_config: TunConfig,
    factory: Arc<dyn FlowFactory>,
    observers: Arc<StatusObservers>,
    live: Mutex<HashMap<ConfigurationId, Arc<LocalConfiguration>>>,
    file_lock: tokio::sync::Mutex<()>,
}

impl LocalStore {
    /// Open the store at `path`; the file is created on first save
    pub async fn open(
        path: impl Into<PathBuf>,
        tun_config: TunConfig,
        factory: Arc<dyn FlowFactory>,
    ) -> CoreResult<Self> {
        tun_config.validate().map_err(CoreError::ConfigError)?;

        let store = Self {
            path: path.into(),
            tun_config,
            factory,
            observers: StatusObservers::new(),
            live: Mutex::new(HashMap::new()),
            file_lock: tokio::sync::Mutex::new(()),
        };

        let file = store.read_file().await?;
        info!(
            "Opened configuration store {} ({} entries)",
            store.path.display(),
            file.configurations.len()
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> CoreResult<StoreFile> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                toml::from_str(&content).map_err(|e| CoreError::SerializationError(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(CoreError::Store(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write_file(&self, file: &StoreFile) -> CoreResult<()> {
        let content = toml::to_string_pretty(file)
            .map_err(|e| CoreError::SerializationError(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<ConfigurationId, Arc<LocalConfiguration>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn materialize(&self, stored: StoredConfiguration) -> Arc<LocalConfiguration> {
        let provider = TunnelProvider::new(self.tun_config.clone(), Arc::clone(&self.factory));
        Arc::new(LocalConfiguration {
            profile: stored.profile,
            cell: Arc::new(StatusCell {
                id: stored.id,
                status: Mutex::new(ConnectionStatus::Disconnected),
                observers: Arc::clone(&self.observers),
            }),
            provider: Arc::new(provider),
        })
    }
}

#[async_trait]
impl ConfigurationStore for LocalStore {
    async fn load_all(&self) -> CoreResult<Vec<Arc<dyn TunnelConfiguration>>> {
        let file = {
            let _guard = self.file_lock.lock().await;
            self.read_file().await?
        };

        let mut live = self.live();
        let mut loaded: Vec<Arc<dyn TunnelConfiguration>> = Vec::new();
        let mut seen = Vec::with_capacity(file.configurations.len());

        for stored in file.configurations {
            seen.push(stored.id);
            let configuration = match live.get(&stored.id) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let id = stored.id;
                    let created = self.materialize(stored);
                    live.insert(id, Arc::clone(&created));
                    created
                }
            };
            loaded.push(configuration);
        }

        // Entries deleted from the file by someone else
        let vanished: Vec<ConfigurationId> =
            live.keys().filter(|id| !seen.contains(id)).copied().collect();
        let vanished: Vec<Arc<LocalConfiguration>> =
            vanished.iter().filter_map(|id| live.remove(id)).collect();
        drop(live);

        for configuration in vanished {
            debug!("Configuration {} disappeared from the store", configuration.id());
            configuration.invalidate();
        }

        Ok(loaded)
    }

    async fn save(&self, profile: &TunnelProfile) -> CoreResult<()> {
        let _guard = self.file_lock.lock().await;
        let mut file = self.read_file().await?;

        let next = file
            .configurations
            .iter()
            .map(|stored| stored.id.0)
            .max()
            .map_or(1, |max| max + 1);
        let id = ConfigurationId(next);

        file.configurations.push(StoredConfiguration {
            id,
            profile: profile.clone(),
        });
        self.write_file(&file).await?;

        info!("Saved configuration {} \"{}\"", id, profile.description);
        Ok(())
    }

    async fn remove(&self, id: ConfigurationId) -> CoreResult<()> {
        {
            let _guard = self.file_lock.lock().await;
            let mut file = self.read_file().await?;
            let before = file.configurations.len();
            file.configurations.retain(|stored| stored.id != id);
            if file.configurations.len() != before {
                self.write_file(&file).await?;
            }
        }

        let removed = self.live().remove(&id);
        if let Some(configuration) = removed {
            configuration.invalidate();
        }

        info!("Removed configuration {}", id);
        Ok(())
    }

    fn subscribe(&self, id: ConfigurationId, callback: StatusCallback) -> Subscription {
        self.observers.subscribe(id, callback)
    }
}
