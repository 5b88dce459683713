//! Synthetic machine used for commissioning and soak tests.
//!
//! Runs an endless READY -> ACTIVE ... ACTIVE -> READY cycle, reports spindle speed while
//! cutting and a `PART_COMPLETED` event at the end of each cycle. Settings:
//! `intervalMs` (default 1000) and `cycleSteps` (default 6, minimum 4).

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{source_for, AdapterError, AdapterHealth, ConnectorAdapter};
use crate::config::EdgeConnectorConfig;
use crate::models::{event_types, EventInfo, Execution, MachineEvent, MachineState, Source, StateMetrics};

pub const MAKE: &str = "SIMULATOR";

const DEFAULT_INTERVAL_MS: u64 = 1_000;
const DEFAULT_CYCLE_STEPS: u64 = 6;
const MIN_CYCLE_STEPS: u64 = 4;

pub struct SimulatedAdapter {
    machine_id: String,
    source: Source,
    interval: Duration,
    cycle_steps: u64,
    running: AtomicBool,
    stream_taken: AtomicBool,
    produced: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl SimulatedAdapter {
    pub fn from_config(config: &EdgeConnectorConfig) -> Result<Self, AdapterError> {
        let interval_ms = config.setting_u64("intervalMs").unwrap_or(DEFAULT_INTERVAL_MS);
        if interval_ms == 0 {
            return Err(AdapterError::InvalidSettings {
                machine_id: config.machine_id.clone(),
                reason: "intervalMs must be positive".into(),
            });
        }
        let cycle_steps = config.setting_u64("cycleSteps").unwrap_or(DEFAULT_CYCLE_STEPS);

        Ok(Self {
            machine_id: config.machine_id.clone(),
            source: source_for(config),
            interval: Duration::from_millis(interval_ms),
            cycle_steps: cycle_steps.max(MIN_CYCLE_STEPS),
            running: AtomicBool::new(false),
            stream_taken: AtomicBool::new(false),
            produced: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        })
    }
}

/// Snapshot for position `step` of a cycle of `steps` events
fn synthesize(machine_id: &str, source: &Source, step: u64, steps: u64, parts: &mut u64) -> MachineEvent {
    let phase = step % steps;
    let execution = if phase == 0 || phase == steps - 1 { Execution::Ready } else { Execution::Active };

    let mut event = MachineEvent::new(machine_id, source.clone(), Utc::now().fixed_offset());
    if phase == steps - 2 {
        *parts += 1;
        event.event = Some(EventInfo {
            event_type: Some(event_types::PART_COMPLETED.to_string()),
            severity: Some("INFO".into()),
            ..Default::default()
        });
    }
    event.state = Some(MachineState {
        power: Some("ON".into()),
        execution: Some(execution),
        mode: Some("AUTOMATIC".into()),
        metrics: Some(StateMetrics {
            spindle_rpm: Some(if execution == Execution::Active { 8_000.0 } else { 0.0 }),
            feedrate: Some(if execution == Execution::Active { 1_200.0 } else { 0.0 }),
            part_count: Some(*parts),
        }),
        ..Default::default()
    });
    event
}

#[async_trait]
impl ConnectorAdapter for SimulatedAdapter {
    fn machine_id(&self) -> &str {
        &self.machine_id
    }

    fn source(&self) -> &Source {
        &self.source
    }

    async fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!(machine_id = %self.machine_id, interval_ms = self.interval.as_millis() as u64, "simulator started");
        }
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    async fn check_health(&self) -> AdapterHealth {
        if self.cancel.is_cancelled() {
            AdapterHealth::unhealthy("stopped")
        } else if !self.running.load(Ordering::SeqCst) {
            AdapterHealth::unhealthy("not started")
        } else {
            AdapterHealth::healthy(format!("{} events produced", self.produced.load(Ordering::Relaxed)))
        }
    }

    fn events(&self) -> BoxStream<'static, MachineEvent> {
        if self.stream_taken.swap(true, Ordering::SeqCst) {
            warn!(machine_id = %self.machine_id, "event stream already taken");
            return stream::empty().boxed();
        }

        let machine_id = self.machine_id.clone();
        let source = self.source.clone();
        let interval = self.interval;
        let steps = self.cycle_steps;
        let produced = Arc::clone(&self.produced);
        let cancel = self.cancel.clone();

        stream::unfold((0u64, 0u64), move |(step, mut parts)| {
            let machine_id = machine_id.clone();
            let source = source.clone();
            let produced = Arc::clone(&produced);
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(interval) => {}
                }
                let event = synthesize(&machine_id, &source, step, steps, &mut parts);
                produced.fetch_add(1, Ordering::Relaxed);
                Some((event, (step + 1, parts)))
            }
        })
        .boxed()
    }
}
