//! In-memory store for coordinator tests

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{
    ConfigurationId, ConfigurationStore, ConnectionStatus, StatusCallback, StatusObservers,
    Subscription, TunnelConfiguration, TunnelProfile,
};
use crate::error::{CoreError, CoreResult};

pub(crate) struct MockConfiguration {
    id: ConfigurationId,
    profile: TunnelProfile,
    status: Mutex<ConnectionStatus>,
    observers: Arc<StatusObservers>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    fail_next_start: AtomicBool,
}

impl MockConfiguration {
    /// Change the status as the system would, notifying on change
    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        {
            let mut current = self.status.lock().unwrap();
            if *current == status {
                return;
            }
            *current = status;
        }
        self.observers.notify(self.id, status);
    }

    pub(crate) fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    pub(crate) fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl TunnelConfiguration for MockConfiguration {
    fn id(&self) -> ConfigurationId {
        self.id
    }

    fn profile(&self) -> TunnelProfile {
        self.profile.clone()
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    fn start(&self) -> CoreResult<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(CoreError::StartFailed("mock refused to start".into()));
        }
        if self.status() == ConnectionStatus::Invalid {
            return Err(CoreError::InvalidConfiguration(self.id));
        }
        if matches!(
            self.status(),
            ConnectionStatus::Disconnected | ConnectionStatus::Disconnecting
        ) {
            self.set_status(ConnectionStatus::Connecting);
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if matches!(
            self.status(),
            ConnectionStatus::Connecting | ConnectionStatus::Connected | ConnectionStatus::Reasserting
        ) {
            self.set_status(ConnectionStatus::Disconnecting);
        }
    }
}

/// Store whose loads can be held at a gate
pub(crate) struct MockStore {
    observers: Arc<StatusObservers>,
    configurations: Mutex<Vec<Arc<MockConfiguration>>>,
    next_id: AtomicU64,
    gate: Semaphore,
    load_calls: AtomicUsize,
    save_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

impl MockStore {
    pub(crate) fn new() -> Self {
        Self::with_permits(1)
    }

    /// Loads block until [`MockStore::open_gate`]
    pub(crate) fn gated() -> Self {
        Self::with_permits(0)
    }

    fn with_permits(permits: usize) -> Self {
        Self {
            observers: StatusObservers::new(),
            configurations: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            gate: Semaphore::new(permits),
            load_calls: AtomicUsize::new(0),
            save_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            fail_loads: AtomicBool::new(false),
            fail_saves: AtomicBool::new(false),
        }
    }

    pub(crate) fn open_gate(&self) {
        self.gate.add_permits(1);
    }

    pub(crate) fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Seed a disconnected configuration
    pub(crate) fn insert(&self, profile: TunnelProfile) -> Arc<MockConfiguration> {
        let configuration = Arc::new(MockConfiguration {
            id: ConfigurationId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            profile,
            status: Mutex::new(ConnectionStatus::Disconnected),
            observers: Arc::clone(&self.observers),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            fail_next_start: AtomicBool::new(false),
        });
        self.configurations
            .lock()
            .unwrap()
            .push(Arc::clone(&configuration));
        configuration
    }

    /// Delete a configuration behind the coordinator's back
    pub(crate) fn remove_externally(&self, id: ConfigurationId) {
        let removed = self.take(id);
        if let Some(configuration) = removed {
            configuration.set_status(ConnectionStatus::Invalid);
        }
    }

    pub(crate) fn configurations(&self) -> Vec<Arc<MockConfiguration>> {
        self.configurations.lock().unwrap().clone()
    }

    pub(crate) fn observer_count(&self, id: ConfigurationId) -> usize {
        self.observers.count(id)
    }

    pub(crate) fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    fn take(&self, id: ConfigurationId) -> Option<Arc<MockConfiguration>> {
        let mut configurations = self.configurations.lock().unwrap();
        let index = configurations.iter().position(|c| c.id == id)?;
        Some(configurations.remove(index))
    }
}

#[async_trait]
impl ConfigurationStore for MockStore {
    async fn load_all(&self) -> CoreResult<Vec<Arc<dyn TunnelConfiguration>>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| CoreError::Store("gate closed".into()))?;

        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(CoreError::Store("mock load failure".into()));
        }

        Ok(self
            .configurations()
            .into_iter()
            .map(|c| c as Arc<dyn TunnelConfiguration>)
            .collect())
    }

    async fn save(&self, profile: &TunnelProfile) -> CoreResult<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(CoreError::Store("mock save failure".into()));
        }
        self.insert(profile.clone());
        Ok(())
    }

    async fn remove(&self, id: ConfigurationId) -> CoreResult<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.remove_externally(id);
        Ok(())
    }

    fn subscribe(&self, id: ConfigurationId, callback: StatusCallback) -> Subscription {
        self.observers.subscribe(id, callback)
    }
}
