//! Tunnel lifecycle coordinator
//!
//! A single worker task owns the tracked configuration and runs the state
//! machine. Callers, status callbacks and the worker itself only *drive* it:
//! drives arriving while a pass is running collapse into one follow-up pass.
//!
//! ```text
//!                   pending request
//!   WaitingRequest ─────────────────▶ ProcessingRequest
//!         ▲   ▲                            │      │
//!         │   └──── detect / failure ──────┘      │ start or stop issued
//!         │                                       ▼
//!         └────────── status stable ───── WaitingStableState
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::state::{TunnelRequest, TunnelState};
use crate::store::{
    ConfigurationStore, ConnectionStatus, ProtocolKind, Subscription, TunnelConfiguration,
    TunnelProfile,
};

/// Lifecycle errors buffered per receiver
const ERROR_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    WaitingRequest,
    ProcessingRequest,
    WaitingStableState,
}

/// Drive pass counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveStats {
    pub passes_started: u64,
    pub passes_completed: u64,
    /// Highest number of passes ever running at the same time
    pub max_active_passes: usize,
}

/// State shared between the handle, the worker and status callbacks
struct Shared {
    pending: Mutex<TunnelRequest>,
    wake: Notify,
    passes_started: AtomicU64,
    passes_completed: AtomicU64,
    active_passes: AtomicUsize,
    max_active_passes: AtomicUsize,
}

impl Shared {
    fn new(initial: TunnelRequest) -> Self {
        Self {
            pending: Mutex::new(initial),
            wake: Notify::new(),
            passes_started: AtomicU64::new(0),
            passes_completed: AtomicU64::new(0),
            active_passes: AtomicUsize::new(0),
            max_active_passes: AtomicUsize::new(0),
        }
    }

    /// Overwrite the pending request and drive
    fn request(&self, request: TunnelRequest) {
        *self.lock_pending() = request;
        self.drive();
    }

    /// Ask for a pass. A single stored permit absorbs any number of drives
    /// issued while a pass is running.
    fn drive(&self) {
        self.wake.notify_one();
    }

    fn pending(&self) -> TunnelRequest {
        *self.lock_pending()
    }

    fn take_pending(&self) -> TunnelRequest {
        std::mem::take(&mut *self.lock_pending())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, TunnelRequest> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> DriveStats {
        DriveStats {
            passes_started: self.passes_started.load(Ordering::SeqCst),
            passes_completed: self.passes_completed.load(Ordering::SeqCst),
            max_active_passes: self.max_active_passes.load(Ordering::SeqCst),
        }
    }
}

/// Coordinates starting, stopping and detecting the tunnel.
///
/// `start` and `stop` return immediately; outcomes show up on the state
/// channel and failures on the error broadcast.
pub struct TunnelManager {
    shared: Arc<Shared>,
    state: watch::Receiver<TunnelState>,
    errors: broadcast::Sender<Arc<CoreError>>,
    shutdown: Arc<Notify>,
    worker: Option<JoinHandle<()>>,
}

impl TunnelManager {
    /// Spawn the coordinator and detect any existing configuration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn ConfigurationStore>, config: CoreConfig) -> Self {
        let shared = Arc::new(Shared::new(TunnelRequest::Detect));
        let (state_tx, state_rx) = watch::channel(TunnelState::Detecting);
        let (error_tx, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let shutdown = Arc::new(Notify::new());

        let machine = Machine {
            store,
            profile: config.profile(),
            shared: Arc::clone(&shared),
            state_tx,
            error_tx: error_tx.clone(),
            phase: Phase::WaitingRequest,
            processing: TunnelRequest::None,
            tracked: None,
        };
        let worker = tokio::spawn(machine.run(Arc::clone(&shutdown)));
        shared.drive();

        Self {
            shared,
            state: state_rx,
            errors: error_tx,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Request the tunnel to come up
    pub fn start(&self) {
        info!("Tunnel start requested");
        self.shared.request(TunnelRequest::Start);
    }

    /// Request the tunnel to go down
    pub fn stop(&self) {
        info!("Tunnel stop requested");
        self.shared.request(TunnelRequest::Stop);
    }

    /// Current public state
    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Observe the public state; the receiver starts at the current value
    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }

    /// Observe lifecycle failures from now on
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Arc<CoreError>> {
        self.errors.subscribe()
    }

    pub fn drive_stats(&self) -> DriveStats {
        self.shared.stats()
    }

    /// Stop the worker after its current pass and release the tracked
    /// configuration
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!("Tunnel coordinator task failed: {}", e);
            }
        }
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

struct Tracked {
    configuration: Arc<dyn TunnelConfiguration>,
    subscription: Subscription,
}

/// Worker-owned half of the coordinator
struct Machine {
    store: Arc<dyn ConfigurationStore>,
    profile: TunnelProfile,
    shared: Arc<Shared>,
    state_tx: watch::Sender<TunnelState>,
    error_tx: broadcast::Sender<Arc<CoreError>>,
    phase: Phase,
    processing: TunnelRequest,
    tracked: Option<Tracked>,
}

impl Machine {
    async fn run(mut self, shutdown: Arc<Notify>) {
        debug!("Tunnel coordinator started");
        let shared = Arc::clone(&self.shared);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                _ = shared.wake.notified() => self.drive().await,
            }
        }

        self.untrack();
        debug!("Tunnel coordinator stopped");
    }

    /// Step until the phase stops changing
    async fn drive(&mut self) {
        let active = self.shared.active_passes.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_active_passes.fetch_max(active, Ordering::SeqCst);
        self.shared.passes_started.fetch_add(1, Ordering::SeqCst);
        trace!("Drive pass started in {:?}", self.phase);

        loop {
            let next = match self.phase {
                Phase::WaitingRequest => self.run_waiting_request(),
                Phase::ProcessingRequest => self.run_processing_request().await,
                Phase::WaitingStableState => self.run_waiting_stable_state(),
            };

            let settled = next == self.phase;
            if !settled {
                debug!("Coordinator: {:?} -> {:?}", self.phase, next);
                self.phase = next;
            }
            self.publish_state();

            if settled {
                break;
            }
        }

        self.shared.active_passes.fetch_sub(1, Ordering::SeqCst);
        self.shared.passes_completed.fetch_add(1, Ordering::SeqCst);
        trace!("Drive pass settled in {:?}", self.phase);
    }

    fn run_waiting_request(&mut self) -> Phase {
        match self.shared.take_pending() {
            TunnelRequest::None => Phase::WaitingRequest,
            request => {
                self.processing = request;
                Phase::ProcessingRequest
            }
        }
    }

    async fn run_processing_request(&mut self) -> Phase {
        match self.processing {
            TunnelRequest::Detect => {
                self.detect().await;
                Phase::WaitingRequest
            }
            TunnelRequest::Start | TunnelRequest::Stop => self.apply(self.processing).await,
            TunnelRequest::None => Phase::WaitingRequest,
        }
    }

    fn run_waiting_stable_state(&self) -> Phase {
        if self.status_or(ConnectionStatus::Disconnected).is_transitional() {
            Phase::WaitingStableState
        } else {
            Phase::WaitingRequest
        }
    }

    /// Adopt an existing configuration; failures only get logged
    async fn detect(&mut self) {
        if self.tracked.is_some() {
            return;
        }

        match self.find_main_configuration().await {
            Ok(Some(configuration)) => {
                info!("Detected tunnel configuration {}", configuration.id());
                self.track(configuration);
            }
            Ok(None) => debug!("No tunnel configuration detected"),
            Err(e) => debug!("Tunnel detection failed: {}", e),
        }
    }

    async fn apply(&mut self, request: TunnelRequest) -> Phase {
        if let Some(tracked) = &self.tracked {
            if tracked.configuration.status() == ConnectionStatus::Invalid {
                info!(
                    "Tunnel configuration {} was removed from the store",
                    tracked.configuration.id()
                );
                self.untrack();
            }
        }

        if self.tracked.is_none() {
            match self.acquire_configuration().await {
                Ok(configuration) => self.track(configuration),
                Err(e) => {
                    self.report(e);
                    return Phase::WaitingRequest;
                }
            }
        }

        let Some(tracked) = &self.tracked else {
            return Phase::WaitingRequest;
        };
        let configuration = Arc::clone(&tracked.configuration);

        match request {
            TunnelRequest::Start => match configuration.start() {
                Ok(()) => {
                    debug!("Start issued for configuration {}", configuration.id());
                    Phase::WaitingStableState
                }
                Err(e) => {
                    self.report(e);
                    Phase::WaitingRequest
                }
            },
            TunnelRequest::Stop => {
                configuration.stop();
                debug!("Stop issued for configuration {}", configuration.id());
                Phase::WaitingStableState
            }
            TunnelRequest::None | TunnelRequest::Detect => Phase::WaitingRequest,
        }
    }

    /// Load the main configuration, creating it from scratch if needed
    async fn acquire_configuration(&self) -> CoreResult<Arc<dyn TunnelConfiguration>> {
        if let Some(configuration) = self.find_main_configuration().await? {
            return Ok(configuration);
        }

        self.remove_all_configurations().await?;
        self.store.save(&self.profile).await?;
        info!("Created tunnel configuration \"{}\"", self.profile.description);

        self.find_main_configuration()
            .await?
            .ok_or(CoreError::TunnelCreationFailure)
    }

    /// The store must hold exactly one packet tunnel configuration
    async fn find_main_configuration(&self) -> CoreResult<Option<Arc<dyn TunnelConfiguration>>> {
        let mut configurations = self.store.load_all().await?;

        if configurations.len() == 1
            && configurations[0].profile().protocol == ProtocolKind::PacketTunnel
        {
            Ok(configurations.pop())
        } else {
            Ok(None)
        }
    }

    async fn remove_all_configurations(&self) -> CoreResult<()> {
        for configuration in self.store.load_all().await? {
            debug!("Removing stale configuration {}", configuration.id());
            configuration.stop();
            self.store.remove(configuration.id()).await?;
        }
        Ok(())
    }

    fn track(&mut self, configuration: Arc<dyn TunnelConfiguration>) {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let subscription = self.store.subscribe(
            configuration.id(),
            Arc::new(move |id, status| {
                trace!("Configuration {} reported {:?}", id, status);
                if let Some(shared) = shared.upgrade() {
                    shared.drive();
                }
            }),
        );

        self.tracked = Some(Tracked {
            configuration,
            subscription,
        });
    }

    fn untrack(&mut self) {
        if let Some(tracked) = self.tracked.take() {
            tracked.subscription.unsubscribe();
        }
    }

    fn status_or(&self, fallback: ConnectionStatus) -> ConnectionStatus {
        self.tracked
            .as_ref()
            .map_or(fallback, |tracked| tracked.configuration.status())
    }

    fn publish_state(&self) {
        let state = TunnelState::derive(
            self.status_or(ConnectionStatus::Invalid),
            self.shared.pending(),
        );

        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            info!("Tunnel state: {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }

    fn report(&self, error: CoreError) {
        warn!("Tunnel lifecycle error: {}", error);
        // No receivers is fine
        let _ = self.error_tx.send(Arc::new(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::broadcast::error::TryRecvError;

    use crate::store::mock::MockStore;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn manager(store: &Arc<MockStore>) -> TunnelManager {
        TunnelManager::new(store.clone(), CoreConfig::default())
    }

    async fn wait_for_state(manager: &TunnelManager, expected: TunnelState) {
        let mut rx = manager.subscribe_state();
        tokio::time::timeout(TIMEOUT, rx.wait_for(|state| *state == expected))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}", expected))
            .expect("state channel closed");
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(TIMEOUT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    /// Wait until no pass is running or queued
    async fn settle(manager: &TunnelManager) {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                let before = manager.drive_stats();
                tokio::time::sleep(Duration::from_millis(20)).await;
                let after = manager.drive_stats();
                if before == after && after.passes_started == after.passes_completed {
                    break;
                }
            }
        })
        .await
        .expect("coordinator never settled");
    }

    #[test]
    fn test_worker_can_run_on_any_thread() {
        // Worker futures hold `&Machine` across awaits
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Machine>();
        assert_send_sync::<TunnelManager>();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tracks_configuration_on_multi_thread_runtime() {
        let store = Arc::new(MockStore::new());
        let existing = store.insert(CoreConfig::default().profile());
        let manager = manager(&store);

        wait_until(|| store.observer_count(existing.id()) == 1).await;
        manager.start();
        wait_for_state(&manager, TunnelState::Connecting).await;

        manager.shutdown().await;
        assert_eq!(store.observer_count(existing.id()), 0);
    }

    #[tokio::test]
    async fn test_initial_detect_without_configuration() {
        let store = Arc::new(MockStore::new());
        let manager = manager(&store);
        let mut errors = manager.subscribe_errors();
        assert_eq!(manager.state(), TunnelState::Detecting);

        wait_for_state(&manager, TunnelState::Disconnected).await;
        settle(&manager).await;

        assert_eq!(store.save_calls(), 0);
        assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_initial_detect_adopts_existing_configuration() {
        let store = Arc::new(MockStore::new());
        let existing = store.insert(CoreConfig::default().profile());
        existing.set_status(ConnectionStatus::Connected);

        let manager = manager(&store);
        wait_for_state(&manager, TunnelState::Connected).await;
        settle(&manager).await;

        assert_eq!(store.observer_count(existing.id()), 1);
        assert_eq!(existing.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_start_creates_configuration_and_connects() {
        let store = Arc::new(MockStore::new());
        let manager = manager(&store);
        wait_for_state(&manager, TunnelState::Disconnected).await;

        manager.start();
        wait_for_state(&manager, TunnelState::Connecting).await;
        settle(&manager).await;

        let configurations = store.configurations();
        assert_eq!(configurations.len(), 1);
        assert_eq!(store.save_calls(), 1);
        let configuration = &configurations[0];
        assert_eq!(configuration.profile(), CoreConfig::default().profile());
        assert_eq!(configuration.start_calls(), 1);
        assert_eq!(manager.state(), TunnelState::Connecting);

        configuration.set_status(ConnectionStatus::Connected);
        wait_for_state(&manager, TunnelState::Connected).await;
        settle(&manager).await;
        assert_eq!(configuration.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_start_then_stop_before_consumed_only_stops() {
        let store = Arc::new(MockStore::gated());
        let existing = store.insert(CoreConfig::default().profile());
        let manager = manager(&store);

        // First pass is parked inside load_all
        wait_until(|| store.load_calls() >= 1).await;
        manager.start();
        manager.stop();
        store.open_gate();
        settle(&manager).await;

        assert_eq!(existing.start_calls(), 0);
        assert_eq!(existing.stop_calls(), 1);
        assert_eq!(manager.state(), TunnelState::Disconnected);
    }

    #[tokio::test]
    async fn test_triggers_during_pass_coalesce_into_one() {
        let store = Arc::new(MockStore::gated());
        let manager = manager(&store);

        wait_until(|| store.load_calls() >= 1).await;
        assert_eq!(manager.drive_stats().passes_started, 1);

        manager.stop();
        manager.stop();
        store.open_gate();
        settle(&manager).await;

        let stats = manager.drive_stats();
        assert_eq!(stats.passes_started, 2);
        assert_eq!(stats.passes_completed, 2);
        assert_eq!(stats.max_active_passes, 1);
    }

    #[tokio::test]
    async fn test_externally_removed_configuration_is_recreated() {
        let store = Arc::new(MockStore::new());
        let original = store.insert(CoreConfig::default().profile());
        let manager = manager(&store);
        wait_until(|| store.observer_count(original.id()) == 1).await;
        settle(&manager).await;

        store.remove_externally(original.id());
        settle(&manager).await;

        manager.start();
        wait_for_state(&manager, TunnelState::Connecting).await;
        settle(&manager).await;

        let configurations = store.configurations();
        assert_eq!(configurations.len(), 1);
        let replacement = &configurations[0];
        assert_ne!(replacement.id(), original.id());
        assert_eq!(replacement.start_calls(), 1);
        assert_eq!(original.start_calls(), 0);
        assert_eq!(store.observer_count(original.id()), 0);
        assert_eq!(store.observer_count(replacement.id()), 1);
    }

    #[tokio::test]
    async fn test_drift_is_cleaned_before_creating() {
        let store = Arc::new(MockStore::new());
        let mut foreign = CoreConfig::default().profile();
        foreign.protocol = ProtocolKind::Other;
        let stale = store.insert(foreign);
        stale.set_status(ConnectionStatus::Connected);
        let duplicate = store.insert(CoreConfig::default().profile());

        let manager = manager(&store);
        wait_for_state(&manager, TunnelState::Disconnected).await;
        manager.start();
        wait_for_state(&manager, TunnelState::Connecting).await;
        settle(&manager).await;

        assert_eq!(stale.stop_calls(), 1);
        assert_eq!(duplicate.stop_calls(), 1);
        assert_eq!(store.remove_calls(), 2);

        let configurations = store.configurations();
        assert_eq!(configurations.len(), 1);
        assert_eq!(configurations[0].start_calls(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_is_broadcast() {
        let store = Arc::new(MockStore::new());
        let existing = store.insert(CoreConfig::default().profile());
        existing.fail_next_start();

        let manager = manager(&store);
        let mut errors = manager.subscribe_errors();
        manager.start();

        let error = tokio::time::timeout(TIMEOUT, errors.recv())
            .await
            .expect("no error broadcast")
            .expect("error channel closed");
        assert!(matches!(*error, CoreError::StartFailed(_)));

        settle(&manager).await;
        assert_eq!(manager.state(), TunnelState::Disconnected);

        // Reissuing the request recovers
        manager.start();
        wait_for_state(&manager, TunnelState::Connecting).await;
        assert_eq!(existing.start_calls(), 2);
    }

    #[tokio::test]
    async fn test_creation_failure_is_broadcast() {
        let store = Arc::new(MockStore::new());
        store.fail_saves(true);
        let manager = manager(&store);
        let mut errors = manager.subscribe_errors();

        manager.start();
        let error = tokio::time::timeout(TIMEOUT, errors.recv())
            .await
            .expect("no error broadcast")
            .expect("error channel closed");
        assert!(matches!(*error, CoreError::Store(_)));

        settle(&manager).await;
        assert_eq!(manager.state(), TunnelState::Disconnected);
        assert!(store.configurations().is_empty());
    }

    #[tokio::test]
    async fn test_detect_failure_is_swallowed() {
        let store = Arc::new(MockStore::new());
        store.fail_loads(true);
        let manager = manager(&store);
        let mut errors = manager.subscribe_errors();

        wait_for_state(&manager, TunnelState::Disconnected).await;
        settle(&manager).await;

        assert!(store.load_calls() >= 1);
        assert!(matches!(errors.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_pending_stop_shows_direction_of_travel() {
        let store = Arc::new(MockStore::new());
        let manager = manager(&store);
        wait_for_state(&manager, TunnelState::Disconnected).await;

        manager.start();
        wait_for_state(&manager, TunnelState::Connecting).await;
        settle(&manager).await;
        let configuration = store.configurations().remove(0);

        // Still connecting: the stop stays pending and is shown as such
        manager.stop();
        wait_for_state(&manager, TunnelState::Disconnecting).await;
        settle(&manager).await;
        assert_eq!(configuration.stop_calls(), 0);

        configuration.set_status(ConnectionStatus::Connected);
        wait_until(|| configuration.stop_calls() == 1).await;
        settle(&manager).await;
        assert_eq!(configuration.status(), ConnectionStatus::Disconnecting);
        assert_eq!(manager.state(), TunnelState::Disconnecting);

        configuration.set_status(ConnectionStatus::Disconnected);
        wait_for_state(&manager, TunnelState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_subscription() {
        let store = Arc::new(MockStore::new());
        let existing = store.insert(CoreConfig::default().profile());
        let manager = manager(&store);
        wait_until(|| store.observer_count(existing.id()) == 1).await;

        manager.shutdown().await;
        assert_eq!(store.observer_count(existing.id()), 0);
    }
}
