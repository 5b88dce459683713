/**
 * UPLINK - Batched delivery of normalized events to the site hub
 *
 * STATE MACHINE : DISCONNECTED -> CONNECTING -> CONNECTED, back to DISCONNECTED on any
 * send failure or lost connection. Every CONNECTING attempt gets a fresh session id.
 *
 * LOOP :
 * 1. make sure a connection exists (connect latency is recorded)
 * 2. drain the queue into a batch until maxEvents, maxBytes or flushMs is reached
 * 3. give the batch a new id and send it
 * 4. ok      -> record the acknowledgment, drop the batch
 *    failure -> spool the batch to disk, back off, force a reconnect
 *
 * The loop only ever blocks on an empty queue or on network I/O; producers are never
 * held up by a failing hub beyond what the queue policy dictates.
 */

pub mod mqtt;
pub mod spool;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::models::{Batch, MachineEvent};
use crate::queue::EventQueue;
use spool::Spool;

#[derive(Debug, thiserror::Error)]
pub enum UplinkError {
    #[error("not connected to hub")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("no acknowledgment within {0:?}")]
    AckTimeout(Duration),
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cancelled")]
    Cancelled,
}

/// Connection to the cloud hub. Implementations keep at most one batch in flight.
#[async_trait]
pub trait HubTransport: Send + Sync {
    /// Open a session; `session_id` is unique per attempt
    async fn connect(&mut self, session_id: &str) -> Result<(), UplinkError>;

    /// Deliver one serialized batch; `Ok` means the hub acknowledged it
    async fn send(&mut self, batch: &Batch, payload: &[u8]) -> Result<(), UplinkError>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum SyncResult {
    Delivered,
    Spooled { path: PathBuf },
    Lost { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub batch_id: Uuid,
    pub events: usize,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub result: SyncResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct UplinkSnapshot {
    pub state: LinkState,
    pub session_id: Option<String>,
    pub last_connect_latency_ms: Option<u64>,
    pub last_sync: Option<SyncOutcome>,
    pub batches_sent: u64,
    pub events_sent: u64,
    pub batches_spooled: u64,
    pub connect_attempts: u64,
}

/// Read-only view on the uplink for the admin surface
#[derive(Clone)]
pub struct UplinkMonitor {
    inner: Arc<Mutex<UplinkSnapshot>>,
}

impl Default for UplinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl UplinkMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(UplinkSnapshot {
                state: LinkState::Disconnected,
                session_id: None,
                last_connect_latency_ms: None,
                last_sync: None,
                batches_sent: 0,
                events_sent: 0,
                batches_spooled: 0,
                connect_attempts: 0,
            })),
        }
    }

    pub fn snapshot(&self) -> UplinkSnapshot {
        self.inner.lock().clone()
    }

    pub fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    fn mark_connecting(&self, session_id: &str) {
        let mut s = self.inner.lock();
        s.state = LinkState::Connecting;
        s.session_id = Some(session_id.to_string());
        s.connect_attempts += 1;
    }

    fn mark_connected(&self, latency: Duration) {
        let mut s = self.inner.lock();
        s.state = LinkState::Connected;
        s.last_connect_latency_ms = Some(latency.as_millis() as u64);
    }

    fn mark_disconnected(&self) {
        self.inner.lock().state = LinkState::Disconnected;
    }

    fn record(&self, batch: &Batch, result: SyncResult) {
        let mut s = self.inner.lock();
        match &result {
            SyncResult::Delivered => {
                s.batches_sent += 1;
                s.events_sent += batch.events.len() as u64;
            }
            SyncResult::Spooled { .. } => s.batches_spooled += 1,
            SyncResult::Lost { .. } => {}
        }
        s.last_sync = Some(SyncOutcome {
            batch_id: batch.batch_id,
            events: batch.events.len(),
            at: Utc::now(),
            result,
        });
    }
}

/// Events accumulated toward the next batch
struct PendingBatch {
    events: Vec<MachineEvent>,
    bytes: usize,
    started: Option<tokio::time::Instant>,
}

impl PendingBatch {
    fn new() -> Self {
        Self { events: Vec::new(), bytes: 0, started: None }
    }

    fn push(&mut self, event: MachineEvent) {
        // JSON size plus the separating comma
        self.bytes += serde_json::to_vec(&event).map(|v| v.len() + 1).unwrap_or(0);
        self.started.get_or_insert_with(tokio::time::Instant::now);
        self.events.push(event);
    }

    fn is_full(&self, limits: &BatchConfig) -> bool {
        self.events.len() >= limits.max_events || self.bytes >= limits.max_bytes
    }

    fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn take(&mut self) -> Vec<MachineEvent> {
        self.bytes = 0;
        self.started = None;
        std::mem::take(&mut self.events)
    }
}

pub struct UplinkSettings {
    pub site_id: String,
    pub batch: BatchConfig,
    pub reconnect_delay: Duration,
}

pub struct Uplink {
    settings: UplinkSettings,
    queue: Arc<EventQueue>,
    transport: Box<dyn HubTransport>,
    spool: Spool,
    monitor: UplinkMonitor,
}

impl Uplink {
    pub fn new(settings: UplinkSettings, queue: Arc<EventQueue>, transport: Box<dyn HubTransport>, spool: Spool) -> Self {
        Self { settings, queue, transport, spool, monitor: UplinkMonitor::new() }
    }

    pub fn monitor(&self) -> UplinkMonitor {
        self.monitor.clone()
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    /// Batch/send loop. Returns after `cancel` fires and the final flush is done.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(site_id = %self.settings.site_id, "uplink started");
        let mut pending = PendingBatch::new();
        let mut events = self.queue.drain_all(cancel.clone()).fuse().boxed();

        while !cancel.is_cancelled() {
            self.ensure_connected(&cancel).await;

            if !self.fill(&mut pending, &mut events, &cancel).await {
                break;
            }
            let batch = Batch::new(self.settings.site_id.clone(), pending.take());
            if !self.deliver(batch).await {
                self.back_off(&cancel).await;
            }
        }

        self.flush_on_shutdown(pending).await;
        self.transport.disconnect().await;
        self.monitor.mark_disconnected();
        info!("uplink stopped");
    }

    async fn ensure_connected(&mut self, cancel: &CancellationToken) {
        if self.transport.is_connected() {
            return;
        }

        let session_id = Uuid::new_v4().to_string();
        self.monitor.mark_connecting(&session_id);
        let started = Instant::now();

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(UplinkError::Cancelled),
            r = self.transport.connect(&session_id) => r,
        };

        match result {
            Ok(()) => {
                let latency = started.elapsed();
                self.monitor.mark_connected(latency);
                info!(session_id = %session_id, latency_ms = latency.as_millis() as u64, "hub connected");
            }
            Err(e) => {
                self.monitor.mark_disconnected();
                warn!(session_id = %session_id, error = %e, "hub connect failed");
            }
        }
    }

    /// Fill `pending` until a flush condition holds. `false` means cancelled; whatever
    /// was gathered stays in `pending` for the shutdown flush.
    async fn fill(
        &self,
        pending: &mut PendingBatch,
        events: &mut BoxStream<'static, MachineEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        let limits = &self.settings.batch;

        if pending.is_empty() {
            match events.next().await {
                Some(event) => pending.push(event),
                None => return false,
            }
        }

        let deadline = pending.started.unwrap_or_else(tokio::time::Instant::now) + limits.flush_interval();

        while !pending.is_full(limits) {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = sleep_until(deadline) => break,
                next = events.next() => match next {
                    Some(event) => pending.push(event),
                    None => return false,
                },
            }
        }
        true
    }

    /// `true` when the hub acknowledged the batch
    async fn deliver(&mut self, batch: Batch) -> bool {
        match self.try_send(&batch).await {
            Ok(()) => {
                debug!(batch_id = %batch.batch_id, events = batch.events.len(), "batch acknowledged");
                self.monitor.record(&batch, SyncResult::Delivered);
                true
            }
            Err(e) => {
                warn!(batch_id = %batch.batch_id, events = batch.events.len(), error = %e, "batch send failed");
                self.spool_batch(&batch).await;
                self.transport.disconnect().await;
                self.monitor.mark_disconnected();
                false
            }
        }
    }

    async fn try_send(&mut self, batch: &Batch) -> Result<(), UplinkError> {
        if !self.transport.is_connected() {
            return Err(UplinkError::NotConnected);
        }
        let payload = batch.to_bytes()?;
        self.transport.send(batch, &payload).await
    }

    async fn spool_batch(&self, batch: &Batch) {
        match self.spool.write_batch(batch).await {
            Ok(path) => {
                info!(batch_id = %batch.batch_id, path = %path.display(), "batch spooled");
                self.monitor.record(batch, SyncResult::Spooled { path });
            }
            Err(e) => {
                error!(batch_id = %batch.batch_id, events = batch.events.len(), error = %e, "spool write failed, batch lost");
                self.monitor.record(batch, SyncResult::Lost { reason: e.to_string() });
            }
        }
    }

    async fn back_off(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
        }
    }

    /// Send what is left (partial batch + queue remainder) once, spool on failure
    async fn flush_on_shutdown(&mut self, mut pending: PendingBatch) {
        while let Some(event) = self.queue.try_dequeue() {
            pending.push(event);
        }
        if pending.is_empty() {
            return;
        }

        let events = pending.take();
        info!(events = events.len(), "flushing remaining events");
        for chunk in events.chunks(self.settings.batch.max_events.max(1)) {
            let batch = Batch::new(self.settings.site_id.clone(), chunk.to_vec());
            if self.transport.is_connected() {
                if self.deliver(batch).await {
                    continue;
                }
            } else {
                self.spool_batch(&batch).await;
            }
        }
    }
}
