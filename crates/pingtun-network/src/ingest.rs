//! Packet ingest loop
//!
//! Pulls batches from the host packet flow, answers what the processor
//! consumes and hands everything else to a diagnostic sink. Cancellation is
//! cooperative: the flag is checked between reads, so a read already in flight
//! completes and its batch is processed before the loop exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::packet::Packet;
use crate::processor::{Ignored, PacketProcessor, ProcessorStats, Verdict};
use crate::tun::PacketFlow;

/// Delay before retrying after a failed read
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Receives every packet the processor did not consume
pub trait DiagnosticSink: Send + Sync {
    fn unhandled(&self, packet: &Packet, reason: &Ignored);
}

/// Logs unhandled packets with a full hex dump
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn unhandled(&self, packet: &Packet, reason: &Ignored) {
        debug!(
            "tunnel data in: family={} data=[{}] ({})",
            packet.family(),
            packet.hex_dump(),
            reason
        );
    }
}

/// Consumer of inbound tunnel packets
pub struct PacketIngestLoop {
    flow: Arc<dyn PacketFlow>,
    processor: Arc<PacketProcessor>,
    sink: Arc<dyn DiagnosticSink>,
}

impl PacketIngestLoop {
    /// Create a loop over `flow` logging unhandled packets through tracing
    pub fn new(flow: Arc<dyn PacketFlow>) -> Self {
        Self {
            flow,
            processor: Arc::new(PacketProcessor::new()),
            sink: Arc::new(TracingSink),
        }
    }

    /// Replace the diagnostic sink
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Start the loop on its own task
    pub fn spawn(self) -> IngestHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let processor = Arc::clone(&self.processor);
        let task = tokio::spawn(self.run(Arc::clone(&cancelled)));

        IngestHandle {
            cancelled,
            processor,
            task: Some(task),
        }
    }

    async fn run(self, cancelled: Arc<AtomicBool>) {
        info!("Packet ingest started on {}", self.flow.name());

        while !cancelled.load(Ordering::SeqCst) {
            let packets = match self.flow.read_packets().await {
                Ok(packets) => packets,
                Err(NetworkError::FlowClosed) => {
                    debug!("Packet flow {} closed", self.flow.name());
                    break;
                }
                Err(e) => {
                    warn!("Packet read error: {}", e);
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                    continue;
                }
            };

            for packet in packets {
                self.handle(packet).await;
            }
        }

        info!("Packet ingest stopped on {}", self.flow.name());
    }

    async fn handle(&self, packet: Packet) {
        match self.processor.process(&packet) {
            Verdict::Reply(reply) => {
                if let Err(e) = self.flow.write_packet(reply).await {
                    warn!("Failed to write reply: {}", e);
                }
            }
            Verdict::Ignored(reason) => self.sink.unhandled(&packet, &reason),
        }
    }
}

/// Handle to a running ingest loop.
///
/// Dropping the handle cancels the loop.
pub struct IngestHandle {
    cancelled: Arc<AtomicBool>,
    processor: Arc<PacketProcessor>,
    task: Option<JoinHandle<()>>,
}

impl IngestHandle {
    /// Request the loop to stop at its next iteration boundary
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn stats(&self) -> ProcessorStats {
        self.processor.stats()
    }

    /// Cancel and wait for the loop to exit
    pub async fn join(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Packet ingest task failed: {}", e);
            }
        }
    }

    /// Cancel and wait up to `grace` for the loop to exit.
    ///
    /// A loop still parked in a read after `grace` is aborted, which drops
    /// its packet flow. Returns whether the loop exited on its own.
    pub async fn stop(mut self, grace: Duration) -> bool {
        self.cancel();
        let Some(mut task) = self.task.take() else {
            return true;
        };

        match tokio::time::timeout(grace, &mut task).await {
            Ok(result) => {
                if let Err(e) = result {
                    warn!("Packet ingest task failed: {}", e);
                }
                true
            }
            Err(_) => {
                debug!("Packet ingest still parked in a read; aborting");
                task.abort();
                // Resolves once the task and its flow are dropped
                let _ = task.await;
                false
            }
        }
    }
}

impl Drop for IngestHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
