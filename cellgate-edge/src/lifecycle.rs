/**
 * CONNECTOR LIFECYCLE - Owns every adapter from configuration to disposal
 *
 * FLOW :
 * load(configs)  -> one adapter per enabled machine, via the make registry
 * start_all()    -> one consumption task per adapter: bounded start(), then its event stream
 * health sweep   -> periodic bounded checks, each on its own task, never auto-restarted
 * stop_ingest()  -> consumption tasks stop pulling, in-flight enqueues finish
 * shutdown()     -> stop adapters concurrently (bounded), then dispose
 *
 * A consumption task that ends (start failure, stream closed, panic) only takes its own
 * machine down.
 */

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{AdapterError, AdapterHealth, AdapterRegistry, ConnectorAdapter};
use crate::config::{EdgeConnectorConfig, SupervisionConfig};
use crate::normalizer::Normalizer;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("machine {machine_id}: no adapter registered for make {make}")]
    UnknownMake { machine_id: String, make: String },
    #[error("machine {0} is already managed")]
    DuplicateMachine(String),
    #[error("machine id must not be empty")]
    MissingMachineId,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("connector manager is shut down")]
    ShutDown,
}

/// Last known health of one connector
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectorStatus {
    pub machine_id: String,
    pub make: String,
    pub healthy: bool,
    pub reason: String,
    pub checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Consumption tasks, at most one per machine
#[derive(Default)]
struct Consumers {
    tasks: JoinSet<String>,
    machines: HashSet<String>,
}

struct ManagedAdapter {
    machine_id: String,
    make: String,
    adapter: Arc<dyn ConnectorAdapter>,
}

pub struct ConnectorManager {
    registry: AdapterRegistry,
    normalizer: Arc<Normalizer>,
    supervision: SupervisionConfig,
    adapters: Mutex<Vec<ManagedAdapter>>,
    statuses: Mutex<HashMap<String, ConnectorStatus>>,
    consumers: Mutex<Consumers>,
    /// Stops consumption tasks from pulling new events
    ingest: CancellationToken,
    /// Aborts enqueues still waiting for queue room
    delivery: CancellationToken,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl ConnectorManager {
    pub fn new(registry: AdapterRegistry, normalizer: Arc<Normalizer>, supervision: SupervisionConfig) -> Self {
        Self {
            registry,
            normalizer,
            supervision,
            adapters: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            consumers: Mutex::new(Consumers::default()),
            ingest: CancellationToken::new(),
            delivery: CancellationToken::new(),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Build adapters for `configs`. Returns the machine ids that were loaded.
    ///
    /// Disabled machines are skipped. Unknown makes and invalid adapter settings skip the
    /// machine with a warning, unless `strictMakes` turns unknown makes into an error.
    pub fn load(&self, configs: &[EdgeConnectorConfig]) -> Result<Vec<String>, LifecycleError> {
        let mut loaded = Vec::new();
        for config in configs {
            if !config.enabled {
                debug!(machine_id = %config.machine_id, "machine disabled, skipped");
                continue;
            }
            match self.register(config) {
                Ok(()) => loaded.push(config.machine_id.clone()),
                Err(LifecycleError::UnknownMake { machine_id, make }) if !self.supervision.strict_makes => {
                    warn!(machine_id = %machine_id, make = %make, supported = ?self.registry.makes(), "unknown make, machine skipped");
                }
                Err(e @ LifecycleError::UnknownMake { .. }) => return Err(e),
                Err(e) => warn!(machine_id = %config.machine_id, error = %e, "machine skipped"),
            }
        }
        info!(count = loaded.len(), machines = ?loaded, "connectors loaded");
        Ok(loaded)
    }

    fn register(&self, config: &EdgeConnectorConfig) -> Result<(), LifecycleError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(LifecycleError::ShutDown);
        }
        if config.machine_id.trim().is_empty() {
            return Err(LifecycleError::MissingMachineId);
        }
        if !self.registry.supports(&config.make) {
            return Err(LifecycleError::UnknownMake {
                machine_id: config.machine_id.clone(),
                make: config.make.clone(),
            });
        }

        let mut adapters = self.adapters.lock();
        if adapters.iter().any(|m| m.machine_id == config.machine_id) {
            return Err(LifecycleError::DuplicateMachine(config.machine_id.clone()));
        }
        let adapter = self.registry.create(config)?;
        adapters.push(ManagedAdapter {
            machine_id: config.machine_id.clone(),
            make: config.make.to_ascii_uppercase(),
            adapter,
        });
        drop(adapters);

        self.statuses.lock().insert(
            config.machine_id.clone(),
            ConnectorStatus {
                machine_id: config.machine_id.clone(),
                make: config.make.to_ascii_uppercase(),
                healthy: false,
                reason: "not checked yet".into(),
                checked_at: None,
                consecutive_failures: 0,
            },
        );
        Ok(())
    }

    /// Spawn one consumption task per loaded adapter. Adapters start concurrently, each
    /// inside its own task.
    pub fn start_all(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let spawned = self
            .snapshot()
            .iter()
            .filter(|(machine_id, _, adapter)| self.spawn_consumer(machine_id, adapter))
            .count();
        info!(count = spawned, "connectors starting");
    }

    /// Bring up a machine found at runtime exactly like a configured one
    pub fn attach(&self, config: EdgeConnectorConfig) -> Result<(), LifecycleError> {
        self.register(&config)?;
        info!(machine_id = %config.machine_id, make = %config.make, "connector attached");

        if self.started.load(Ordering::SeqCst) {
            let adapter = self
                .adapters
                .lock()
                .iter()
                .find(|m| m.machine_id == config.machine_id)
                .map(|m| Arc::clone(&m.adapter));
            if let Some(adapter) = adapter {
                self.spawn_consumer(&config.machine_id, &adapter);
            }
        }
        Ok(())
    }

    /// `false` when the machine already has a consumer
    fn spawn_consumer(&self, machine_id: &str, adapter: &Arc<dyn ConnectorAdapter>) -> bool {
        let mut consumers = self.consumers.lock();
        if !consumers.machines.insert(machine_id.to_string()) {
            return false;
        }
        consumers.tasks.spawn(consume(
            machine_id.to_string(),
            Arc::clone(adapter),
            Arc::clone(&self.normalizer),
            self.supervision.start_timeout(),
            self.ingest.clone(),
            self.delivery.clone(),
        ));
        true
    }

    fn snapshot(&self) -> Vec<(String, String, Arc<dyn ConnectorAdapter>)> {
        self.adapters
            .lock()
            .iter()
            .map(|m| (m.machine_id.clone(), m.make.clone(), Arc::clone(&m.adapter)))
            .collect()
    }

    pub fn machine_ids(&self) -> Vec<String> {
        self.adapters.lock().iter().map(|m| m.machine_id.clone()).collect()
    }

    /// Check every adapter, each on its own task and bounded by `healthCheckTimeoutSecs`.
    /// A check that panics counts as unhealthy.
    pub async fn health_check_all(&self) -> Vec<ConnectorStatus> {
        self.reap_finished_consumers();

        let timeout = self.supervision.health_check_timeout();
        let checks = self.snapshot().into_iter().map(|(machine_id, make, adapter)| {
            let check = tokio::spawn(async move { tokio::time::timeout(timeout, adapter.check_health()).await });
            async move {
                let health = match check.await {
                    Ok(Ok(health)) => health,
                    Ok(Err(_)) => AdapterHealth::unhealthy(format!("health check timed out after {timeout:?}")),
                    Err(e) => {
                        error!(machine_id = %machine_id, error = %e, "health check task failed");
                        AdapterHealth::unhealthy(if e.is_panic() { "health check panicked" } else { "health check cancelled" })
                    }
                };
                (machine_id, make, health)
            }
        });
        let results = join_all(checks).await;

        let now = Utc::now();
        let mut statuses = self.statuses.lock();
        let mut report = Vec::with_capacity(results.len());
        for (machine_id, make, health) in results {
            let status = statuses.entry(machine_id.clone()).or_insert_with(|| ConnectorStatus {
                machine_id: machine_id.clone(),
                make,
                healthy: false,
                reason: String::new(),
                checked_at: None,
                consecutive_failures: 0,
            });
            status.healthy = health.healthy;
            status.reason = health.reason;
            status.checked_at = Some(now);
            if health.healthy {
                status.consecutive_failures = 0;
            } else {
                status.consecutive_failures += 1;
                warn!(
                    machine_id = %machine_id,
                    reason = %status.reason,
                    failures = status.consecutive_failures,
                    "connector unhealthy"
                );
            }
            report.push(status.clone());
        }
        report
    }

    /// Log consumption tasks that already ended
    fn reap_finished_consumers(&self) {
        let mut consumers = self.consumers.lock();
        while let Some(joined) = consumers.tasks.try_join_next() {
            log_joined(joined);
        }
    }

    /// Periodic health sweep until `cancel` fires
    pub fn spawn_health_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.supervision.health_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let report = manager.health_check_all().await;
                        let healthy = report.iter().filter(|s| s.healthy).count();
                        info!(healthy, total = report.len(), "connector health sweep");
                    }
                }
            }
        })
    }

    /// Last recorded status per machine, sorted by machine id
    pub fn statuses(&self) -> Vec<ConnectorStatus> {
        let mut statuses: Vec<ConnectorStatus> = self.statuses.lock().values().cloned().collect();
        statuses.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        statuses
    }

    /// Stop pulling events and wait up to `wait` for in-flight enqueues.
    /// Consumers still blocked after that have their enqueue cancelled.
    pub async fn stop_ingest(&self, wait: Duration) {
        self.ingest.cancel();
        let mut loops = std::mem::take(&mut self.consumers.lock().tasks);

        let drained = tokio::time::timeout(wait, async {
            while let Some(joined) = loops.join_next().await {
                log_joined(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = loops.len(), "consumers still enqueuing, cancelling their writes");
            self.delivery.cancel();
            while let Some(joined) = loops.join_next().await {
                log_joined(joined);
            }
        }
    }

    /// Stop every adapter concurrently, then dispose of them. Safe to call twice.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_ingest(self.supervision.stop_timeout()).await;

        let adapters = self.snapshot();
        let timeout = self.supervision.stop_timeout();
        let stops = adapters.iter().map(|(machine_id, _, adapter)| {
            let adapter = Arc::clone(adapter);
            let stop = tokio::spawn(async move { tokio::time::timeout(timeout, adapter.stop()).await.is_ok() });
            async move {
                match stop.await {
                    Ok(true) => {}
                    Ok(false) => warn!(machine_id = %machine_id, timeout_secs = timeout.as_secs(), "adapter stop timed out"),
                    Err(e) => error!(machine_id = %machine_id, error = %e, "adapter stop failed"),
                }
            }
        });
        join_all(stops).await;

        self.delivery.cancel();
        self.adapters.lock().clear();
        info!(count = adapters.len(), "connectors shut down");
    }
}

fn log_joined(joined: Result<String, tokio::task::JoinError>) {
    match joined {
        Ok(machine_id) => debug!(machine_id = %machine_id, "consumer finished"),
        Err(e) if e.is_panic() => error!(error = %e, "consumer task panicked"),
        Err(e) => debug!(error = %e, "consumer task cancelled"),
    }
}

/// Start one adapter, then pull its events into the normalizer until ingest stops or the
/// stream ends
async fn consume(
    machine_id: String,
    adapter: Arc<dyn ConnectorAdapter>,
    normalizer: Arc<Normalizer>,
    start_timeout: Duration,
    ingest: CancellationToken,
    delivery: CancellationToken,
) -> String {
    let started = tokio::select! {
        biased;
        _ = ingest.cancelled() => false,
        started = tokio::time::timeout(start_timeout, adapter.start()) => started.is_ok(),
    };
    if !started {
        if !ingest.is_cancelled() {
            error!(machine_id = %machine_id, timeout_secs = start_timeout.as_secs(), "adapter start timed out, connector left down");
        }
        return machine_id;
    }
    debug!(machine_id = %machine_id, "adapter started");

    let mut events = adapter.events();
    let mut pulled: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = ingest.cancelled() => break,
            next = events.next() => next,
        };
        match next {
            Some(event) => {
                pulled += 1;
                normalizer.enqueue(event, &delivery).await;
            }
            None => {
                warn!(machine_id = %machine_id, "event stream ended");
                break;
            }
        }
    }
    debug!(machine_id = %machine_id, pulled, "consumer stopped");
    machine_id
}
