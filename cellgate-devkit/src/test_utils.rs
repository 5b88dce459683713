/*!
Test harness running a full gateway against the devkit stubs

The storage root is a temporary directory removed when the harness drops. Batches flush
fast (100 ms) so pipeline tests stay short.
*/

use anyhow::Result;
use cellgate_edge::adapters::AdapterRegistry;
use cellgate_edge::config::{EdgeConfig, EdgeConnectorConfig};
use cellgate_edge::health::{GatewayHealth, HealthTracker};
use cellgate_edge::lifecycle::ConnectorManager;
use cellgate_edge::models::Batch;
use cellgate_edge::uplink::spool::Spool;
use cellgate_edge::Gateway;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::hub_stub::MockHubTransport;
use crate::scripted_adapter::ScriptedAdapter;

pub struct TestHarness {
    pub hub: MockHubTransport,
    pub config: EdgeConfig,
    pub registry: AdapterRegistry,
    storage: TempDir,
}

/// Gateway running in a background task
pub struct RunningGateway {
    pub health: HealthTracker,
    pub connectors: Arc<ConnectorManager>,
    shutdown: CancellationToken,
    task: JoinHandle<GatewayHealth>,
}

impl RunningGateway {
    /// Trigger the ordered shutdown and wait for the final snapshot
    pub async fn stop(self) -> Result<GatewayHealth> {
        self.shutdown.cancel();
        Ok(self.task.await?)
    }
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("cellgate_edge=debug"))
            .with_test_writer()
            .try_init();

        let storage = tempfile::tempdir()?;
        let mut config = EdgeConfig { site_id: "test-site".into(), storage_root: storage.path().to_path_buf(), ..Default::default() };
        config.transport.batch.flush_ms = 100;
        config.transport.reconnect_delay_ms = 50;
        config.supervision.stop_timeout_secs = 2;

        Ok(Self { hub: MockHubTransport::new(), config, registry: AdapterRegistry::with_builtin(), storage })
    }

    /// Register a scripted make replaying `events_per_machine` events per machine
    pub fn with_scripted_make(mut self, make: &str, events_per_machine: usize) -> Self {
        ScriptedAdapter::register(&mut self.registry, make, events_per_machine);
        self
    }

    pub fn with_machine(mut self, machine_id: &str, make: &str) -> Self {
        self.config.machines.push(EdgeConnectorConfig {
            machine_id: machine_id.into(),
            make: make.into(),
            model: None,
            ip_address: Some("127.0.0.1".into()),
            protocol: "scripted".into(),
            enabled: true,
            settings: HashMap::new(),
        });
        self
    }

    pub fn with_hub(mut self, hub: MockHubTransport) -> Self {
        self.hub = hub;
        self
    }

    pub fn storage_root(&self) -> PathBuf {
        self.storage.path().to_path_buf()
    }

    pub fn spool(&self) -> Spool {
        Spool::new(self.config.spool_dir())
    }

    pub async fn build(&self) -> Result<Gateway> {
        let gateway = Gateway::build(self.config.clone(), self.registry.clone(), Box::new(self.hub.clone())).await?;
        Ok(gateway.with_status_interval(Duration::from_millis(200)))
    }

    pub async fn start(&self) -> Result<RunningGateway> {
        let gateway = self.build().await?;
        let health = gateway.health_tracker();
        let connectors = gateway.connectors();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(gateway.run(shutdown.clone()));
        info!("test gateway started");
        Ok(RunningGateway { health, connectors, shutdown, task })
    }

    /// Every batch currently in the spool
    pub async fn spooled_batches(&self) -> Result<Vec<Batch>> {
        let mut batches = Vec::new();
        for path in self.spool().list().await? {
            batches.push(Spool::read_batch(&path).await?);
        }
        Ok(batches)
    }
}

/// Poll `condition` every 10 ms until it holds or `limit` elapses
pub async fn wait_until<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
