use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::lifecycle::{ConnectorManager, ConnectorStatus};
use crate::normalizer::{Normalizer, NormalizerStats};
use crate::queue::EventQueue;
use crate::uplink::spool::{Spool, SpoolStats};
use crate::uplink::{LinkState, UplinkMonitor, UplinkSnapshot};

pub const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Admin view of the whole gateway
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayHealth {
    pub site_id: String,
    pub uptime_seconds: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub queue_evicted: u64,
    pub spool: SpoolStats,
    pub connectors: Vec<ConnectorStatus>,
    pub uplink: UplinkSnapshot,
    pub normalizer: NormalizerStats,
}

impl GatewayHealth {
    pub fn healthy_connectors(&self) -> usize {
        self.connectors.iter().filter(|c| c.healthy).count()
    }
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    site_id: String,
    queue: Arc<EventQueue>,
    normalizer: Arc<Normalizer>,
    connectors: Arc<ConnectorManager>,
    uplink: UplinkMonitor,
    spool: Spool,
}

impl HealthTracker {
    pub fn new(
        site_id: impl Into<String>,
        queue: Arc<EventQueue>,
        normalizer: Arc<Normalizer>,
        connectors: Arc<ConnectorManager>,
        uplink: UplinkMonitor,
        spool: Spool,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            site_id: site_id.into(),
            queue,
            normalizer,
            connectors,
            uplink,
            spool,
        }
    }

    pub async fn get_health(&self) -> GatewayHealth {
        let spool = match self.spool.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "spool stats unavailable");
                SpoolStats::default()
            }
        };

        GatewayHealth {
            site_id: self.site_id.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            queue_depth: self.queue.approximate_depth(),
            queue_capacity: self.queue.capacity(),
            queue_evicted: self.queue.evicted_count(),
            spool,
            connectors: self.connectors.statuses(),
            uplink: self.uplink.snapshot(),
            normalizer: self.normalizer.stats(),
        }
    }

    /// Log a one-line gateway summary every `period` until cancelled
    pub fn spawn_status_reporter(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let health = tracker.get_health().await;
                        let link = match health.uplink.state {
                            LinkState::Connected => "connected",
                            LinkState::Connecting => "connecting",
                            LinkState::Disconnected => "disconnected",
                        };
                        info!(
                            uptime_s = health.uptime_seconds,
                            queue_depth = health.queue_depth,
                            evicted = health.queue_evicted,
                            spool_files = health.spool.files,
                            connectors_healthy = health.healthy_connectors(),
                            connectors = health.connectors.len(),
                            uplink = link,
                            batches_sent = health.uplink.batches_sent,
                            batches_spooled = health.uplink.batches_spooled,
                            "gateway status"
                        );
                    }
                }
            }
        })
    }
}
