//! Gateway configuration
//!
//! Loaded from a YAML file (`CELLGATE_CONFIG`, default `edge.yaml`) with a couple of
//! environment overrides. A missing file falls back to defaults; a file that does not
//! parse, or global settings that make no sense, are hard errors. Bad machine entries
//! are dropped one by one so they never block the others.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;

use crate::queue::OverflowPolicy;

pub const CONFIG_PATH_ENV: &str = "CELLGATE_CONFIG";
pub const SITE_ID_ENV: &str = "CELLGATE_SITE_ID";
pub const HUB_URL_ENV: &str = "CELLGATE_HUB_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeConfig {
    pub site_id: String,
    /// Root for local state; the spool lives in `<storageRoot>/spool`
    pub storage_root: PathBuf,
    pub machines: Vec<EdgeConnectorConfig>,
    pub transport: TransportConfig,
    pub queue: QueueConfig,
    pub normalizer: NormalizerConfig,
    pub supervision: SupervisionConfig,
}

/// One physical machine, as supplied by the config (or discovery) collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeConnectorConfig {
    pub machine_id: String,
    pub make: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    pub protocol: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    pub hub_url: String,
    /// Base backoff after a failed batch
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    pub max_events: usize,
    pub max_bytes: usize,
    pub flush_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NormalizerConfig {
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisionConfig {
    pub health_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    /// Bound on one adapter's `start()`; a connector that misses it stays down
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    /// Reject unknown makes at startup instead of skipping them
    pub strict_makes: bool,
}

fn default_true() -> bool {
    true
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            site_id: "site-local".into(),
            storage_root: PathBuf::from("./data"),
            machines: Vec::new(),
            transport: TransportConfig::default(),
            queue: QueueConfig::default(),
            normalizer: NormalizerConfig::default(),
            supervision: SupervisionConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hub_url: "mqtt://localhost:1883".into(),
            reconnect_delay_ms: 5_000,
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 10_000,
            batch: BatchConfig::default(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_events: 500, max_bytes: 256 * 1024, flush_ms: 1_000 }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 10_000, overflow_policy: OverflowPolicy::Block }
    }
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self { debounce_ms: 5_000 }
    }
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 30,
            health_check_timeout_secs: 5,
            start_timeout_secs: 30,
            stop_timeout_secs: 10,
            strict_makes: false,
        }
    }
}

impl TransportConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_ms)
    }
}

impl SupervisionConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl EdgeConnectorConfig {
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(|v| v.as_u64())
    }
}

impl EdgeConfig {
    pub fn spool_dir(&self) -> PathBuf {
        self.storage_root.join("spool")
    }

    /// Parse a YAML document; empty text yields the defaults
    pub fn from_yaml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Apply `CELLGATE_SITE_ID` / `CELLGATE_HUB_URL` when set
    pub fn apply_env_overrides(&mut self) {
        if let Ok(site) = std::env::var(SITE_ID_ENV) {
            if !site.trim().is_empty() {
                self.site_id = site;
            }
        }
        if let Ok(url) = std::env::var(HUB_URL_ENV) {
            if !url.trim().is_empty() {
                self.transport.hub_url = url;
            }
        }
    }

    /// Check global settings and drop unusable machine entries.
    /// Returns the ids (or positions) of the machines that were removed.
    pub fn validate(&mut self) -> Result<Vec<String>, ConfigError> {
        if self.site_id.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "siteId", reason: "must not be empty".into() });
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid { field: "queue.capacity", reason: "must be positive".into() });
        }
        if self.transport.batch.max_events == 0 {
            return Err(ConfigError::Invalid {
                field: "transport.batch.maxEvents",
                reason: "must be positive".into(),
            });
        }
        if self.transport.batch.max_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "transport.batch.maxBytes",
                reason: "must be positive".into(),
            });
        }
        if self.transport.batch.flush_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "transport.batch.flushMs",
                reason: "must be positive".into(),
            });
        }
        if self.transport.hub_url.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "transport.hubUrl", reason: "must not be empty".into() });
        }

        let mut rejected = Vec::new();
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(self.machines.len());

        for (index, machine) in self.machines.drain(..).enumerate() {
            let label = if machine.machine_id.trim().is_empty() {
                format!("#{index}")
            } else {
                machine.machine_id.clone()
            };

            let problem = if machine.machine_id.trim().is_empty() {
                Some("machineId is empty")
            } else if machine.make.trim().is_empty() {
                Some("make is empty")
            } else if !seen.insert(machine.machine_id.clone()) {
                Some("duplicate machineId")
            } else {
                None
            };

            match problem {
                Some(reason) => {
                    warn!(machine = %label, reason, "machine configuration rejected");
                    rejected.push(label);
                }
                None => kept.push(machine),
            }
        }

        self.machines = kept;
        Ok(rejected)
    }
}

/// Load the gateway configuration from `CELLGATE_CONFIG` (default `edge.yaml`)
pub async fn load_config() -> Result<EdgeConfig, ConfigError> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "edge.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from<P: AsRef<Path>>(path: P) -> Result<EdgeConfig, ConfigError> {
    let path = path.as_ref();
    let origin = path.display().to_string();

    let mut config = if path.exists() {
        let text = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: origin.clone(),
            source,
        })?;
        EdgeConfig::from_yaml(&text, &origin)?
    } else {
        warn!(path = %origin, "no configuration file, using defaults");
        EdgeConfig::default()
    };

    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
siteId: plant-7
storageRoot: /var/lib/cellgate
machines:
  - machineId: vf2-01
    make: SIMULATOR
    protocol: synthetic
    settings:
      intervalMs: 250
  - machineId: ""
    make: FANUC
    protocol: focas
  - machineId: vf2-01
    make: SIMULATOR
    protocol: synthetic
transport:
  hubUrl: mqtt://hub.plant-7.local:8883
  reconnectDelayMs: 2000
  batch:
    maxEvents: 50
    maxBytes: 65536
    flushMs: 500
queue:
  capacity: 128
  overflowPolicy: drop-oldest
"#;

    #[test]
    fn test_parse_sample() {
        let config = EdgeConfig::from_yaml(SAMPLE, "sample").unwrap();
        assert_eq!(config.site_id, "plant-7");
        assert_eq!(config.transport.batch.max_events, 50);
        assert_eq!(config.transport.ack_timeout_ms, 10_000);
        assert_eq!(config.queue.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.machines[0].setting_u64("intervalMs"), Some(250));
        assert!(config.machines[0].enabled);
        assert_eq!(config.spool_dir(), PathBuf::from("/var/lib/cellgate/spool"));
        assert_eq!(config.supervision.health_interval_secs, 30);
    }

    #[test]
    fn test_validate_drops_bad_machines_only() {
        let mut config = EdgeConfig::from_yaml(SAMPLE, "sample").unwrap();
        let rejected = config.validate().unwrap();
        assert_eq!(rejected, vec!["#1".to_string(), "vf2-01".to_string()]);
        assert_eq!(config.machines.len(), 1);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = EdgeConfig::default();
        config.queue.capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "queue.capacity", .. })
        ));
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = EdgeConfig::from_yaml("  \n", "empty").unwrap();
        assert_eq!(config.queue.capacity, 10_000);
        assert_eq!(config.normalizer.debounce_ms, 5_000);
    }

    #[test]
    fn test_shipped_example_is_valid() {
        let text = include_str!("../../edge.example.yaml");
        let mut config = EdgeConfig::from_yaml(text, "edge.example.yaml").unwrap();
        assert!(config.validate().unwrap().is_empty());
        assert_eq!(config.machines.len(), 3);
        assert!(!config.machines[2].enabled);
        assert_eq!(config.machines[1].ip_address.as_deref(), Some("10.0.4.3"));
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(config.transport.batch.max_events, 500);
    }
}
