/*!
Connector adapter replaying a fixed script of events

Events are released once `start()` has been called, then the stream idles until `stop()`.
*/

use async_trait::async_trait;
use cellgate_edge::adapters::{source_for, AdapterHealth, AdapterRegistry, ConnectorAdapter};
use cellgate_edge::config::EdgeConnectorConfig;
use cellgate_edge::models::{MachineEvent, Source};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::event_builder::part_counter_series;

pub struct ScriptedAdapter {
    machine_id: String,
    source: Source,
    script: Mutex<Option<Vec<MachineEvent>>>,
    started: CancellationToken,
    stopped: CancellationToken,
    healthy: AtomicBool,
    starts: AtomicUsize,
}

impl ScriptedAdapter {
    /// `script` is stamped with this adapter's machine id and source
    pub fn new(machine_id: &str, source: Source, script: Vec<MachineEvent>) -> Self {
        let script = script
            .into_iter()
            .map(|mut event| {
                event.machine_id = Some(machine_id.to_string());
                event.source = source.clone();
                event
            })
            .collect();
        Self {
            machine_id: machine_id.to_string(),
            source,
            script: Mutex::new(Some(script)),
            started: CancellationToken::new(),
            stopped: CancellationToken::new(),
            healthy: AtomicBool::new(true),
            starts: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Register `make` so every machine of that make replays `events_per_machine`
    /// part-counter events
    pub fn register(registry: &mut AdapterRegistry, make: &str, events_per_machine: usize) {
        registry.register(make, move |cfg: &EdgeConnectorConfig| {
            let script = part_counter_series(&cfg.machine_id, events_per_machine);
            Ok(Arc::new(ScriptedAdapter::new(&cfg.machine_id, source_for(cfg), script)) as Arc<dyn ConnectorAdapter>)
        });
    }
}

#[async_trait]
impl ConnectorAdapter for ScriptedAdapter {
    fn machine_id(&self) -> &str {
        &self.machine_id
    }

    fn source(&self) -> &Source {
        &self.source
    }

    async fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.started.cancel();
    }

    async fn stop(&self) {
        self.stopped.cancel();
    }

    async fn check_health(&self) -> AdapterHealth {
        if self.stopped.is_cancelled() {
            AdapterHealth::unhealthy("stopped")
        } else if self.healthy.load(Ordering::SeqCst) {
            AdapterHealth::healthy("scripted")
        } else {
            AdapterHealth::unhealthy("scripted failure")
        }
    }

    fn events(&self) -> BoxStream<'static, MachineEvent> {
        let Some(script) = self.script.lock().take() else {
            return stream::empty().boxed();
        };
        let started = self.started.clone();
        let stopped = self.stopped.clone();

        let gate = stream::once(async move {
            started.cancelled().await;
        })
        .filter_map(|_| async { None::<MachineEvent> });

        let idle = stream::once(async move {
            stopped.cancelled().await;
        })
        .filter_map(|_| async { None::<MachineEvent> });

        gate.chain(stream::iter(script)).chain(idle).boxed()
    }
}
