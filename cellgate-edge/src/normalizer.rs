/**
 * NORMALIZER - Business-rule layer between the adapters and the queue
 *
 * ROLE : turns a raw adapter event into a queue-ready envelope.
 *
 * STEPS (per event) :
 * 1. field completion (siteId default, machineId required, UTC timestamp, availability)
 * 2. execution transition inference (CYCLE_START, CYCLE_STOP, FEED_HOLD, ...)
 * 3. derived facts (cycle time on PART_COMPLETED)
 * 4. debounce of repeated (machine, type, code) events
 * 5. enqueue
 *
 * A bad record is logged with its machine id and dropped; it never stops the pipeline.
 */

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{event_types, DerivedFacts, EventInfo, Execution, MachineEvent, MachineState, DEFAULT_AVAILABILITY};
use crate::queue::{EventQueue, QueueError};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("event has no machineId")]
    MissingMachineId,
}

/// What happened to one event
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Forward(MachineEvent),
    Debounced { key: String },
}

/// Per-machine memory used for transition inference and cycle timing
#[derive(Debug, Default, Clone)]
struct MachineTrack {
    last_execution: Option<Execution>,
    cycle_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct NormalizerState {
    machines: HashMap<String, MachineTrack>,
    last_forwarded: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NormalizerStats {
    pub accepted: u64,
    pub rejected: u64,
    pub debounced: u64,
}

pub struct Normalizer {
    site_id: String,
    debounce: ChronoDuration,
    state: Mutex<NormalizerState>,
    queue: Arc<EventQueue>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    debounced: AtomicU64,
}

/// Fixed transition table; `None` for pairs that carry no meaning
pub fn infer_transition(previous: Execution, current: Execution) -> Option<&'static str> {
    use Execution::*;
    match (previous, current) {
        (Interrupted, Active) => Some(event_types::FEED_RESUME),
        (_, Active) => Some(event_types::CYCLE_START),
        (Active, Ready) => Some(event_types::CYCLE_STOP),
        (Active, Interrupted) => Some(event_types::FEED_HOLD),
        (_, Alarm) => Some(event_types::ALARM),
        _ => None,
    }
}

fn debounce_key(machine_id: &str, event: &EventInfo) -> Option<String> {
    let event_type = event.event_type.as_deref()?;
    Some(format!("{}|{}|{}", machine_id, event_type, event.code.as_deref().unwrap_or("")))
}

impl Normalizer {
    pub fn new(site_id: impl Into<String>, debounce_window: Duration, queue: Arc<EventQueue>) -> Self {
        Self {
            site_id: site_id.into(),
            debounce: ChronoDuration::from_std(debounce_window).unwrap_or_else(|_| ChronoDuration::seconds(5)),
            state: Mutex::new(NormalizerState::default()),
            queue,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            debounced: AtomicU64::new(0),
        }
    }

    /// Normalize one event and hand it to the queue.
    ///
    /// `cancel` only matters under the `block` policy, where it aborts the wait for room.
    pub async fn enqueue(&self, event: MachineEvent, cancel: &CancellationToken) {
        let machine = event.machine_id.clone().unwrap_or_default();

        match self.normalize(event) {
            Ok(Outcome::Forward(event)) => {
                if let Err(QueueError::Cancelled) = self.queue.enqueue(event, cancel).await {
                    warn!(machine_id = %machine, "enqueue cancelled, event dropped");
                }
            }
            Ok(Outcome::Debounced { key }) => {
                debug!(machine_id = %machine, key = %key, "event debounced");
            }
            Err(e) => {
                warn!(machine_id = %machine, error = %e, "event rejected during normalization");
            }
        }
    }

    /// Synchronous part of the pipeline. The state lock is held for the whole event so
    /// transitions are evaluated in arrival order.
    pub fn normalize(&self, mut event: MachineEvent) -> Result<Outcome, NormalizeError> {
        // 1. field completion
        let machine_id = match event.machine_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(NormalizeError::MissingMachineId);
            }
        };
        event.machine_id = Some(machine_id.clone());

        if event.site_id.as_deref().map_or(true, |s| s.trim().is_empty()) {
            event.site_id = Some(self.site_id.clone());
        }

        let at = event.timestamp_utc();
        event.timestamp = at.fixed_offset();

        if let Some(state) = event.state.as_mut() {
            fill_availability(state);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let track = state.machines.entry(machine_id.clone()).or_default();

        // 2. transition inference
        if let Some(current) = event.execution() {
            let previous = track.last_execution.replace(current);
            if let Some(previous) = previous.filter(|p| *p != current) {
                if event.event_type().is_none() {
                    if let Some(inferred) = infer_transition(previous, current) {
                        debug!(machine_id = %machine_id, from = %previous, to = %current, inferred, "transition inferred");
                        event.event.get_or_insert_with(EventInfo::default).event_type = Some(inferred.to_string());
                    }
                }
            }
        }

        // 3. derived facts
        match event.event_type().map(str::to_owned).as_deref() {
            Some(event_types::CYCLE_START) => track.cycle_started_at = Some(at),
            Some(event_types::PART_COMPLETED) => {
                if let Some(started) = track.cycle_started_at {
                    let cycle_ms = (at - started).num_milliseconds();
                    info!(machine_id = %machine_id, cycle_time_ms = cycle_ms, "cycle time observed");
                    event.derived.get_or_insert_with(DerivedFacts::default).cycle_time_ms = Some(cycle_ms);
                }
            }
            _ => {}
        }

        // 4. debounce (only events that carry a type); anything older than the last forwarded
        // timestamp falls inside the window, so the anchor only moves forward
        if let Some(key) = event.event.as_ref().and_then(|e| debounce_key(&machine_id, e)) {
            if let Some(last) = state.last_forwarded.get(&key) {
                if at < *last + self.debounce {
                    self.debounced.fetch_add(1, Ordering::Relaxed);
                    return Ok(Outcome::Debounced { key });
                }
            }
            state.last_forwarded.insert(key, at);
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(Outcome::Forward(event))
    }

    pub fn stats(&self) -> NormalizerStats {
        NormalizerStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            debounced: self.debounced.load(Ordering::Relaxed),
        }
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }
}

fn fill_availability(state: &mut MachineState) {
    if state.availability.as_deref().map_or(true, |a| a.trim().is_empty()) {
        state.availability = Some(DEFAULT_AVAILABILITY.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Source;
    use crate::queue::OverflowPolicy;
    use chrono::TimeZone;

    fn normalizer() -> Normalizer {
        let queue = Arc::new(EventQueue::new(64, OverflowPolicy::Block));
        Normalizer::new("site-a", Duration::from_secs(5), queue)
    }

    fn at(secs: i64) -> DateTime<chrono::FixedOffset> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap().fixed_offset()
    }

    fn source() -> Source {
        Source { vendor: "okuma".into(), protocol: "thinc".into(), ip: None }
    }

    fn with_execution(secs: i64, execution: Execution) -> MachineEvent {
        let mut event = MachineEvent::new("m-1", source(), at(secs));
        event.state = Some(MachineState { execution: Some(execution), ..Default::default() });
        event
    }

    fn with_type(secs: i64, event_type: &str, code: Option<&str>) -> MachineEvent {
        let mut event = MachineEvent::new("m-1", source(), at(secs));
        event.event = Some(EventInfo {
            event_type: Some(event_type.to_string()),
            code: code.map(str::to_string),
            ..Default::default()
        });
        event
    }

    fn forwarded(outcome: Outcome) -> MachineEvent {
        match outcome {
            Outcome::Forward(event) => event,
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn test_fills_defaults_and_converts_to_utc() {
        let n = normalizer();
        let local = chrono::DateTime::parse_from_rfc3339("2024-05-02T10:15:00+02:00").unwrap();
        let mut event = MachineEvent::new("m-1", source(), local);
        event.state = Some(MachineState::default());

        let out = forwarded(n.normalize(event).unwrap());
        assert_eq!(out.site_id.as_deref(), Some("site-a"));
        assert_eq!(out.timestamp.offset().local_minus_utc(), 0);
        assert_eq!(out.timestamp.to_rfc3339(), "2024-05-02T08:15:00+00:00");
        assert_eq!(out.state.unwrap().availability.as_deref(), Some("AVAILABLE"));
    }

    #[test]
    fn test_keeps_adapter_site_id() {
        let n = normalizer();
        let mut event = MachineEvent::new("m-1", source(), at(0));
        event.site_id = Some("site-b".into());
        assert_eq!(forwarded(n.normalize(event).unwrap()).site_id.as_deref(), Some("site-b"));
    }

    #[test]
    fn test_rejects_missing_machine_id() {
        let n = normalizer();
        let mut event = MachineEvent::new("", source(), at(0));
        assert_eq!(n.normalize(event.clone()), Err(NormalizeError::MissingMachineId));
        event.machine_id = None;
        assert_eq!(n.normalize(event), Err(NormalizeError::MissingMachineId));
        assert_eq!(n.stats().rejected, 2);
    }

    #[test]
    fn test_transition_inference_ready_active_ready() {
        let n = normalizer();
        let first = forwarded(n.normalize(with_execution(0, Execution::Ready)).unwrap());
        let second = forwarded(n.normalize(with_execution(10, Execution::Active)).unwrap());
        let third = forwarded(n.normalize(with_execution(20, Execution::Ready)).unwrap());

        assert_eq!(first.event_type(), None);
        assert_eq!(second.event_type(), Some("CYCLE_START"));
        assert_eq!(third.event_type(), Some("CYCLE_STOP"));
    }

    #[test]
    fn test_transition_table() {
        use Execution::*;
        assert_eq!(infer_transition(Interrupted, Active), Some("FEED_RESUME"));
        assert_eq!(infer_transition(Stopped, Active), Some("CYCLE_START"));
        assert_eq!(infer_transition(Active, Interrupted), Some("FEED_HOLD"));
        assert_eq!(infer_transition(Ready, Alarm), Some("ALARM"));
        assert_eq!(infer_transition(Ready, Stopped), None);
        assert_eq!(infer_transition(Alarm, Ready), None);
    }

    #[test]
    fn test_explicit_type_is_not_overwritten() {
        let n = normalizer();
        n.normalize(with_execution(0, Execution::Ready)).unwrap();
        let mut event = with_execution(10, Execution::Active);
        event.event = Some(EventInfo { event_type: Some("PROGRAM_LOADED".into()), ..Default::default() });
        assert_eq!(forwarded(n.normalize(event).unwrap()).event_type(), Some("PROGRAM_LOADED"));
    }

    #[test]
    fn test_unchanged_state_infers_nothing() {
        let n = normalizer();
        n.normalize(with_execution(0, Execution::Active)).unwrap();
        let again = forwarded(n.normalize(with_execution(1, Execution::Active)).unwrap());
        assert_eq!(again.event_type(), None);
    }

    #[test]
    fn test_debounce_window() {
        let n = normalizer();
        assert!(matches!(n.normalize(with_type(0, "ALARM", Some("1010"))), Ok(Outcome::Forward(_))));
        assert!(matches!(n.normalize(with_type(1, "ALARM", Some("1010"))), Ok(Outcome::Debounced { .. })));
        assert!(matches!(n.normalize(with_type(6, "ALARM", Some("1010"))), Ok(Outcome::Forward(_))));
        // different code, different key
        assert!(matches!(n.normalize(with_type(7, "ALARM", Some("2020"))), Ok(Outcome::Forward(_))));
        assert_eq!(n.stats().debounced, 1);
        assert_eq!(n.stats().accepted, 3);
    }

    #[test]
    fn test_late_event_does_not_reopen_window() {
        let n = normalizer();
        assert!(matches!(n.normalize(with_type(10, "ALARM", Some("1"))), Ok(Outcome::Forward(_))));
        assert!(matches!(n.normalize(with_type(4, "ALARM", Some("1"))), Ok(Outcome::Debounced { .. })));
        assert!(matches!(n.normalize(with_type(10, "ALARM", Some("1"))), Ok(Outcome::Debounced { .. })));
        assert!(matches!(n.normalize(with_type(16, "ALARM", Some("1"))), Ok(Outcome::Forward(_))));
        assert_eq!(n.stats().debounced, 2);
    }

    #[test]
    fn test_empty_source_is_forwarded() {
        let n = normalizer();
        let event = MachineEvent::new("m-1", Source { vendor: String::new(), protocol: String::new(), ip: None }, at(0));
        assert!(matches!(n.normalize(event), Ok(Outcome::Forward(_))));
        assert_eq!(n.stats().rejected, 0);
    }

    #[test]
    fn test_plain_snapshots_are_not_debounced() {
        let n = normalizer();
        for secs in 0..3 {
            let event = MachineEvent::new("m-1", source(), at(secs));
            assert!(matches!(n.normalize(event), Ok(Outcome::Forward(_))));
        }
    }

    #[test]
    fn test_cycle_time_attached_on_part_completed() {
        let n = normalizer();
        n.normalize(with_execution(0, Execution::Ready)).unwrap();
        n.normalize(with_execution(10, Execution::Active)).unwrap();
        let done = forwarded(n.normalize(with_type(52, "PART_COMPLETED", None)).unwrap());
        assert_eq!(done.derived.and_then(|d| d.cycle_time_ms), Some(42_000));
    }

    #[test]
    fn test_part_completed_without_cycle_start() {
        let n = normalizer();
        let done = forwarded(n.normalize(with_type(5, "PART_COMPLETED", None)).unwrap());
        assert!(done.derived.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_forwards_to_queue() {
        let n = normalizer();
        let cancel = CancellationToken::new();
        n.enqueue(with_type(0, "ALARM", Some("1")), &cancel).await;
        n.enqueue(with_type(1, "ALARM", Some("1")), &cancel).await;
        n.enqueue(MachineEvent::new("", source(), at(2)), &cancel).await;

        assert_eq!(n.queue().approximate_depth(), 1);
        let queued = n.queue().try_dequeue().unwrap();
        assert_eq!(queued.site_id.as_deref(), Some("site-a"));
    }
}
