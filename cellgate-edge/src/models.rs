/**
 * MODELS - Canonical event envelope shared by every stage of the pipeline
 *
 * ROLE : `MachineEvent` is what adapters produce, what the normalizer enriches, what the
 * queue buffers and what the uplink ships inside a `Batch`.
 *
 * WIRE FORMAT : JSON, camelCase keys. Spool files use the exact same encoding.
 */

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Event types the pipeline itself knows about (adapters may emit others)
pub mod event_types {
    pub const CYCLE_START: &str = "CYCLE_START";
    pub const CYCLE_STOP: &str = "CYCLE_STOP";
    pub const FEED_HOLD: &str = "FEED_HOLD";
    pub const FEED_RESUME: &str = "FEED_RESUME";
    pub const ALARM: &str = "ALARM";
    pub const PART_COMPLETED: &str = "PART_COMPLETED";
}

pub const DEFAULT_AVAILABILITY: &str = "AVAILABLE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Adapter clock, converted to UTC (+00:00) by the normalizer
    pub timestamp: DateTime<FixedOffset>,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<MachineState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<JobContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived: Option<DerivedFacts>,
}

/// Provenance, set once by the adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub vendor: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<Execution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<ProgramInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Overrides>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StateMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub name: Option<String>,
    pub block: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub id: Option<String>,
    pub life: Option<f64>,
}

/// Operator override percentages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overrides {
    pub feed: Option<f64>,
    pub spindle: Option<f64>,
    pub rapid: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetrics {
    #[serde(rename = "spindleRPM")]
    pub spindle_rpm: Option<f64>,
    pub feedrate: Option<f64>,
    pub part_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventInfo {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Job / workholding association
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixture_id: Option<String>,
}

/// Facts computed by the normalizer, never by adapters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedFacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_time_ms: Option<i64>,
}

impl MachineEvent {
    /// Minimal envelope; adapters fill `state` / `event` afterwards
    pub fn new(machine_id: impl Into<String>, source: Source, timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            site_id: None,
            machine_id: Some(machine_id.into()),
            timestamp,
            source,
            state: None,
            event: None,
            context: None,
            derived: None,
        }
    }

    pub fn execution(&self) -> Option<Execution> {
        self.state.as_ref().and_then(|s| s.execution)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.event.as_ref().and_then(|e| e.event_type.as_deref())
    }

    pub fn event_code(&self) -> Option<&str> {
        self.event.as_ref().and_then(|e| e.code.as_deref())
    }

    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        self.timestamp.with_timezone(&Utc)
    }
}

/// Canonical execution vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Execution {
    Ready,
    Active,
    Interrupted,
    Stopped,
    Alarm,
}

impl Execution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Execution::Ready => "READY",
            Execution::Active => "ACTIVE",
            Execution::Interrupted => "INTERRUPTED",
            Execution::Stopped => "STOPPED",
            Execution::Alarm => "ALARM",
        }
    }
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown execution state: {0}")]
pub struct UnknownExecution(pub String);

impl FromStr for Execution {
    type Err = UnknownExecution;

    /// Canonical names plus the textual aliases controllers commonly report
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "READY" | "IDLE" | "WAIT" | "WAITING" => Ok(Execution::Ready),
            "ACTIVE" | "RUNNING" | "RUN" | "AUTO_RUN" => Ok(Execution::Active),
            "INTERRUPTED" | "FEED_HOLD" | "HOLD" | "PAUSED" | "OPTIONAL_STOP" => Ok(Execution::Interrupted),
            "STOPPED" | "STOP" | "PROGRAM_STOPPED" | "RESET" => Ok(Execution::Stopped),
            "ALARM" | "EMERGENCY" | "ESTOP" | "FAULT" => Ok(Execution::Alarm),
            _ => Err(UnknownExecution(s.to_string())),
        }
    }
}

impl TryFrom<String> for Execution {
    type Error = UnknownExecution;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Execution> for String {
    fn from(value: Execution) -> Self {
        value.as_str().to_string()
    }
}

/// Unit of acknowledgment, retry and spooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub site_id: String,
    pub batch_id: Uuid,
    pub events: Vec<MachineEvent>,
}

impl Batch {
    pub fn new(site_id: impl Into<String>, events: Vec<MachineEvent>) -> Self {
        Self {
            site_id: site_id.into(),
            batch_id: Uuid::new_v4(),
            events,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> Source {
        Source { vendor: "haas".into(), protocol: "mtconnect".into(), ip: Some("10.0.0.5".into()) }
    }

    #[test]
    fn test_execution_aliases() {
        assert_eq!("running".parse::<Execution>().unwrap(), Execution::Active);
        assert_eq!("Feed-Hold".parse::<Execution>().unwrap(), Execution::Interrupted);
        assert_eq!("ESTOP".parse::<Execution>().unwrap(), Execution::Alarm);
        assert!("SPINNING".parse::<Execution>().is_err());
    }

    #[test]
    fn test_wire_keys_are_camel_case() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T08:00:00+01:00").unwrap();
        let mut event = MachineEvent::new("m-1", source(), ts);
        event.state = Some(MachineState {
            execution: Some(Execution::Active),
            metrics: Some(StateMetrics { spindle_rpm: Some(1200.0), feedrate: None, part_count: Some(3) }),
            ..Default::default()
        });
        event.event = Some(EventInfo { event_type: Some("CYCLE_START".into()), ..Default::default() });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["machineId"], "m-1");
        assert_eq!(json["state"]["execution"], "ACTIVE");
        assert_eq!(json["state"]["metrics"]["spindleRPM"], 1200.0);
        assert_eq!(json["state"]["metrics"]["partCount"], 3);
        assert_eq!(json["event"]["type"], "CYCLE_START");
        assert!(json.get("siteId").is_none());
    }

    #[test]
    fn test_batch_wire_shape() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T08:00:00Z").unwrap();
        let batch = Batch::new("site-a", vec![MachineEvent::new("m-1", source(), ts)]);
        let json: serde_json::Value = serde_json::from_slice(&batch.to_bytes().unwrap()).unwrap();
        assert_eq!(json["siteId"], "site-a");
        assert_eq!(json["batchId"], batch.batch_id.to_string());
        assert_eq!(json["events"].as_array().unwrap().len(), 1);
    }
}
