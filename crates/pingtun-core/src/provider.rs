//! Packet tunnel provider
//!
//! Hosts the packet engine for one tunnel: opening the host flow applies the
//! interface settings, after which the ingest loop answers pings until the
//! tunnel is stopped.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pingtun_network::{
    DiagnosticSink, FlowFactory, IngestHandle, PacketIngestLoop, ProcessorStats, TunConfig,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};

/// How long stop waits for the ingest loop to wind down
const STOP_GRACE: Duration = Duration::from_millis(500);

pub struct TunnelProvider {
    tun_config: TunConfig,
    factory: Arc<dyn FlowFactory>,
    sink: Option<Arc<dyn DiagnosticSink>>,
    ingest: Mutex<Option<IngestHandle>>,
}

impl TunnelProvider {
    pub fn new(tun_config: TunConfig, factory: Arc<dyn FlowFactory>) -> Self {
        Self {
            tun_config,
            factory,
            sink: None,
            ingest: Mutex::new(None),
        }
    }

    /// Route unhandled packets to `sink` instead of the log
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn tun_config(&self) -> &TunConfig {
        &self.tun_config
    }

    /// Apply the interface settings and start answering packets.
    ///
    /// Starting a running tunnel is a no-op.
    pub async fn start_tunnel(&self) -> CoreResult<()> {
        info!("Tunnel start on {}", self.tun_config.name);
        self.tun_config.validate().map_err(CoreError::ConfigError)?;

        let mut ingest = self.ingest.lock().await;
        if ingest.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Tunnel {} already running", self.tun_config.name);
            return Ok(());
        }

        let flow = self.factory.open(&self.tun_config).await.map_err(|e| {
            warn!("Tunnel start error: {}", e);
            e
        })?;

        let mut ingest_loop = PacketIngestLoop::new(flow);
        if let Some(sink) = &self.sink {
            ingest_loop = ingest_loop.with_sink(Arc::clone(sink));
        }
        *ingest = Some(ingest_loop.spawn());

        info!(
            "Tunnel up: {} address {} routes {:?}",
            self.tun_config.name, self.tun_config.address, self.tun_config.included_routes
        );
        Ok(())
    }

    /// Stop answering packets.
    ///
    /// The loop exits after its in-flight read; if that read does not
    /// return within a short grace period the loop is aborted. Either way
    /// the flow is released when this returns.
    pub async fn stop_tunnel(&self) {
        info!("Tunnel stop on {}", self.tun_config.name);

        let handle = self.ingest.lock().await.take();
        if let Some(handle) = handle {
            if !handle.stop(STOP_GRACE).await {
                debug!("Ingest loop on {} aborted in a read", self.tun_config.name);
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.ingest
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Counters of the current ingest loop
    pub async fn stats(&self) -> Option<ProcessorStats> {
        self.ingest.lock().await.as_ref().map(IngestHandle::stats)
    }

    /// Answer a message from the controlling app by echoing it back
    pub fn handle_app_message(&self, message: Bytes) -> Option<Bytes> {
        debug!("Tunnel app message ({} bytes)", message.len());
        Some(message)
    }

    /// The host is about to sleep
    pub fn sleep(&self) {
        info!("Tunnel sleep");
    }

    /// The host woke up
    pub fn wake(&self) {
        info!("Tunnel wake");
    }
}
