/**
 * CONNECTOR ADAPTERS - Uniform contract over vendor machine protocols
 *
 * ROLE :
 * One adapter per physical machine. It owns the protocol session (polling loop,
 * subscription, stream) and translates whatever the controller reports into
 * canonical `MachineEvent`s, including the vendor execution code mapping.
 *
 * CONTRACT :
 * - start()        idempotent, returns quickly; failures show up in check_health()
 * - stop()         best effort, safe even if start() never succeeded
 * - check_health() never fails, returns healthy + human readable reason
 * - events()       lazy endless stream for the adapter lifetime, taken once
 *
 * REGISTRY :
 * `AdapterRegistry` maps a make tag (upper-cased) to a factory. The lifecycle
 * manager asks it for one adapter per configured machine.
 */

pub mod mqtt_bridge;
pub mod simulated;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EdgeConnectorConfig;
use crate::models::{MachineEvent, Source};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("unknown make: {0}")]
    UnknownMake(String),
    #[error("invalid settings for {machine_id}: {reason}")]
    InvalidSettings { machine_id: String, reason: String },
}

/// Result of one health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterHealth {
    pub healthy: bool,
    pub reason: String,
}

impl AdapterHealth {
    pub fn healthy(reason: impl Into<String>) -> Self {
        Self { healthy: true, reason: reason.into() }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self { healthy: false, reason: reason.into() }
    }
}

#[async_trait]
pub trait ConnectorAdapter: Send + Sync {
    fn machine_id(&self) -> &str;

    /// Provenance stamped on every event this adapter yields
    fn source(&self) -> &Source;

    async fn start(&self);

    async fn stop(&self);

    async fn check_health(&self) -> AdapterHealth;

    /// Endless event stream. A second call returns an empty stream.
    fn events(&self) -> BoxStream<'static, MachineEvent>;
}

pub type AdapterFactory =
    Arc<dyn Fn(&EdgeConnectorConfig) -> Result<Arc<dyn ConnectorAdapter>, AdapterError> + Send + Sync>;

/// Make tag -> adapter constructor
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the adapters shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(simulated::MAKE, |cfg| {
            Ok(Arc::new(simulated::SimulatedAdapter::from_config(cfg)?) as Arc<dyn ConnectorAdapter>)
        });
        registry.register(mqtt_bridge::MAKE, |cfg| {
            Ok(Arc::new(mqtt_bridge::MqttBridgeAdapter::from_config(cfg)?) as Arc<dyn ConnectorAdapter>)
        });
        registry
    }

    pub fn register<F>(&mut self, make: &str, factory: F)
    where
        F: Fn(&EdgeConnectorConfig) -> Result<Arc<dyn ConnectorAdapter>, AdapterError> + Send + Sync + 'static,
    {
        self.factories.insert(make.trim().to_ascii_uppercase(), Arc::new(factory));
    }

    pub fn supports(&self, make: &str) -> bool {
        self.factories.contains_key(&make.trim().to_ascii_uppercase())
    }

    pub fn makes(&self) -> Vec<String> {
        let mut makes: Vec<String> = self.factories.keys().cloned().collect();
        makes.sort();
        makes
    }

    pub fn create(&self, config: &EdgeConnectorConfig) -> Result<Arc<dyn ConnectorAdapter>, AdapterError> {
        let factory = self
            .factories
            .get(&config.make.trim().to_ascii_uppercase())
            .ok_or_else(|| AdapterError::UnknownMake(config.make.clone()))?;
        factory(config)
    }
}

/// `source` block for an adapter built from `config`
pub fn source_for(config: &EdgeConnectorConfig) -> Source {
    Source {
        vendor: config.make.clone(),
        protocol: config.protocol.clone(),
        ip: config.ip_address.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(make: &str) -> EdgeConnectorConfig {
        EdgeConnectorConfig {
            machine_id: "m-1".into(),
            make: make.into(),
            model: None,
            ip_address: Some("10.1.1.1".into()),
            protocol: "synthetic".into(),
            enabled: true,
            settings: HashMap::new(),
        }
    }

    #[test]
    fn test_builtin_makes_are_case_insensitive() {
        let registry = AdapterRegistry::with_builtin();
        assert!(registry.supports("simulator"));
        assert!(registry.supports(" Mqtt "));
        assert_eq!(registry.makes(), vec!["MQTT".to_string(), "SIMULATOR".to_string()]);

        let adapter = registry.create(&machine("Simulator")).unwrap();
        assert_eq!(adapter.machine_id(), "m-1");
        assert_eq!(adapter.source().ip.as_deref(), Some("10.1.1.1"));
    }

    #[test]
    fn test_unknown_make_is_rejected() {
        let registry = AdapterRegistry::with_builtin();
        assert!(matches!(
            registry.create(&machine("ACME")),
            Err(AdapterError::UnknownMake(make)) if make == "ACME"
        ));
    }
}
