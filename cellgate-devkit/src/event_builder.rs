/*!
Fluent builder for canonical machine events
*/

use cellgate_edge::models::{
    DerivedFacts, EventInfo, Execution, JobContext, MachineEvent, MachineState, Source, StateMetrics,
};
use chrono::{DateTime, Duration, FixedOffset, Utc};

#[derive(Debug, Clone)]
pub struct EventBuilder {
    event: MachineEvent,
}

impl EventBuilder {
    /// Event for `machine_id` stamped now, from a `TEST`/`synthetic` source
    pub fn new(machine_id: &str) -> Self {
        let source = Source { vendor: "TEST".into(), protocol: "synthetic".into(), ip: None };
        Self { event: MachineEvent::new(machine_id, source, Utc::now().fixed_offset()) }
    }

    pub fn source(mut self, vendor: &str, protocol: &str) -> Self {
        self.event.source.vendor = vendor.into();
        self.event.source.protocol = protocol.into();
        self
    }

    pub fn site(mut self, site_id: &str) -> Self {
        self.event.site_id = Some(site_id.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<FixedOffset>) -> Self {
        self.event.timestamp = timestamp;
        self
    }

    /// Shift the timestamp by `ms` milliseconds
    pub fn offset_ms(mut self, ms: i64) -> Self {
        self.event.timestamp += Duration::milliseconds(ms);
        self
    }

    pub fn execution(mut self, execution: Execution) -> Self {
        self.state().execution = Some(execution);
        self
    }

    pub fn part_count(mut self, count: u64) -> Self {
        self.state()
            .metrics
            .get_or_insert_with(|| StateMetrics { spindle_rpm: None, feedrate: None, part_count: None })
            .part_count = Some(count);
        self
    }

    pub fn event_type(mut self, event_type: &str) -> Self {
        self.info().event_type = Some(event_type.into());
        self
    }

    pub fn code(mut self, code: &str) -> Self {
        self.info().code = Some(code.into());
        self
    }

    pub fn job(mut self, job_id: &str) -> Self {
        self.event.context = Some(JobContext { job_id: Some(job_id.into()), ..Default::default() });
        self
    }

    pub fn cycle_time_ms(mut self, ms: i64) -> Self {
        self.event.derived = Some(DerivedFacts { cycle_time_ms: Some(ms) });
        self
    }

    pub fn build(self) -> MachineEvent {
        self.event
    }

    fn state(&mut self) -> &mut MachineState {
        self.event.state.get_or_insert_with(MachineState::default)
    }

    fn info(&mut self) -> &mut EventInfo {
        self.event.event.get_or_insert_with(EventInfo::default)
    }
}

/// `count` events for `machine_id`, one second apart, with increasing part counts
pub fn part_counter_series(machine_id: &str, count: usize) -> Vec<MachineEvent> {
    let start = Utc::now().fixed_offset();
    (0..count)
        .map(|i| {
            EventBuilder::new(machine_id)
                .at(start)
                .offset_ms(i as i64 * 1_000)
                .part_count(i as u64)
                .build()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_fills_nested_blocks() {
        let event = EventBuilder::new("m-1")
            .execution(Execution::Active)
            .part_count(7)
            .event_type("ALARM")
            .code("E-12")
            .job("job-9")
            .build();

        assert_eq!(event.machine_id.as_deref(), Some("m-1"));
        assert_eq!(event.execution(), Some(Execution::Active));
        assert_eq!(event.state.unwrap().metrics.unwrap().part_count, Some(7));
        assert_eq!(event.event.as_ref().and_then(|e| e.code.as_deref()), Some("E-12"));
        assert_eq!(event.context.unwrap().job_id.as_deref(), Some("job-9"));
    }

    #[test]
    fn test_series_is_spaced() {
        let series = part_counter_series("m-1", 3);
        assert_eq!((series[2].timestamp - series[0].timestamp).num_seconds(), 2);
    }
}
