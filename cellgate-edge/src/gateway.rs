/**
 * GATEWAY - Wires adapters, normalizer, queue and uplink into one running process
 *
 *   adapters --> consumption tasks --> normalizer --> queue --> uplink --> hub
 *                                                                 '--> spool
 *
 * SHUTDOWN ORDER :
 * 1. stop ingest, let in-flight enqueues finish
 * 2. stop the uplink (final flush or spool)
 * 3. stop and dispose adapters
 */

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapters::AdapterRegistry;
use crate::config::{ConfigError, EdgeConfig};
use crate::health::{GatewayHealth, HealthTracker, STATUS_REPORT_INTERVAL};
use crate::lifecycle::{ConnectorManager, LifecycleError};
use crate::normalizer::Normalizer;
use crate::queue::EventQueue;
use crate::uplink::spool::{Spool, SpoolError};
use crate::uplink::{HubTransport, Uplink, UplinkSettings};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("spool directory unusable: {0}")]
    Spool(#[from] SpoolError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

pub struct Gateway {
    config: EdgeConfig,
    connectors: Arc<ConnectorManager>,
    uplink: Uplink,
    health: HealthTracker,
    status_interval: Duration,
}

impl Gateway {
    /// Validate `config`, check the spool and load the configured machines
    pub async fn build(
        mut config: EdgeConfig,
        registry: AdapterRegistry,
        transport: Box<dyn HubTransport>,
    ) -> Result<Self, GatewayError> {
        let rejected = config.validate()?;
        if !rejected.is_empty() {
            warn!(rejected = ?rejected, "some machines were dropped from the configuration");
        }

        let spool = Spool::new(config.spool_dir());
        spool.ensure_writable().await?;

        let queue = Arc::new(EventQueue::new(config.queue.capacity, config.queue.overflow_policy));
        let normalizer = Arc::new(Normalizer::new(
            config.site_id.clone(),
            Duration::from_millis(config.normalizer.debounce_ms),
            Arc::clone(&queue),
        ));

        let connectors = Arc::new(ConnectorManager::new(
            registry,
            Arc::clone(&normalizer),
            config.supervision.clone(),
        ));
        connectors.load(&config.machines)?;

        let uplink = Uplink::new(
            UplinkSettings {
                site_id: config.site_id.clone(),
                batch: config.transport.batch.clone(),
                reconnect_delay: config.transport.reconnect_delay(),
            },
            Arc::clone(&queue),
            transport,
            spool.clone(),
        );

        let health = HealthTracker::new(
            config.site_id.clone(),
            queue,
            normalizer,
            Arc::clone(&connectors),
            uplink.monitor(),
            spool,
        );

        info!(
            site_id = %config.site_id,
            machines = connectors.machine_ids().len(),
            queue_capacity = config.queue.capacity,
            policy = ?config.queue.overflow_policy,
            "gateway built"
        );

        Ok(Self { config, connectors, uplink, health, status_interval: STATUS_REPORT_INTERVAL })
    }

    /// Override the status log period (default 30 s)
    pub fn with_status_interval(mut self, period: Duration) -> Self {
        self.status_interval = period;
        self
    }

    pub fn health_tracker(&self) -> HealthTracker {
        self.health.clone()
    }

    pub fn connectors(&self) -> Arc<ConnectorManager> {
        Arc::clone(&self.connectors)
    }

    pub async fn health(&self) -> GatewayHealth {
        self.health.get_health().await
    }

    /// Run until `shutdown` fires, then stop in order. Returns the final health snapshot.
    pub async fn run(self, shutdown: CancellationToken) -> GatewayHealth {
        let Self { config, connectors, uplink, health, status_interval } = self;

        let uplink_cancel = CancellationToken::new();
        let background = shutdown.child_token();

        let uplink_task = tokio::spawn(uplink.run(uplink_cancel.clone()));
        connectors.start_all();
        let monitor = connectors.spawn_health_monitor(background.clone());
        let reporter = health.spawn_status_reporter(status_interval, background.clone());

        info!(site_id = %config.site_id, "gateway running");
        shutdown.cancelled().await;
        info!("shutdown requested");

        connectors.stop_ingest(config.supervision.stop_timeout()).await;

        uplink_cancel.cancel();
        if let Err(e) = uplink_task.await {
            error!(error = %e, "uplink task failed");
        }

        connectors.shutdown().await;

        for task in [monitor, reporter] {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }

        let last = health.get_health().await;
        info!(
            queue_depth = last.queue_depth,
            spool_files = last.spool.files,
            batches_sent = last.uplink.batches_sent,
            "gateway stopped"
        );
        last
    }
}
