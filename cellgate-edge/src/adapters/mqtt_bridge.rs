//! Bridge adapter for machines whose on-board collector already speaks the canonical
//! envelope and publishes it as JSON on a local MQTT broker.
//!
//! Settings: `brokerUrl` (default `mqtt://localhost:1883`) and `topic`
//! (default `cellgate/machines/{machineId}/events`).

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{source_for, AdapterError, AdapterHealth, ConnectorAdapter};
use crate::config::EdgeConnectorConfig;
use crate::models::{MachineEvent, Source};
use crate::uplink::mqtt::parse_broker_url;

pub const MAKE: &str = "MQTT";

const CHANNEL_DEPTH: usize = 256;
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// State shared between the adapter handle and its subscriber task
struct LinkState {
    connected: AtomicBool,
    malformed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

pub struct MqttBridgeAdapter {
    machine_id: String,
    source: Source,
    host: String,
    port: u16,
    topic: String,
    started: AtomicBool,
    link: Arc<LinkState>,
    sender: Mutex<Option<mpsc::Sender<MachineEvent>>>,
    receiver: Mutex<Option<mpsc::Receiver<MachineEvent>>>,
    cancel: CancellationToken,
}

impl MqttBridgeAdapter {
    pub fn from_config(config: &EdgeConnectorConfig) -> Result<Self, AdapterError> {
        let url = config.setting_str("brokerUrl").unwrap_or("mqtt://localhost:1883");
        let (host, port) = parse_broker_url(url).map_err(|e| AdapterError::InvalidSettings {
            machine_id: config.machine_id.clone(),
            reason: e.to_string(),
        })?;
        let topic = config
            .setting_str("topic")
            .map(str::to_string)
            .unwrap_or_else(|| format!("cellgate/machines/{}/events", config.machine_id));

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

        Ok(Self {
            machine_id: config.machine_id.clone(),
            source: source_for(config),
            host: host.to_string(),
            port,
            topic,
            started: AtomicBool::new(false),
            link: Arc::new(LinkState {
                connected: AtomicBool::new(false),
                malformed: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
        })
    }
}

/// Decode one payload and stamp this adapter's identity on it. Collectors may omit
/// `source` entirely; only a published `source.ip` is kept.
fn decode(payload: &[u8], machine_id: &str, source: &Source) -> Result<MachineEvent, serde_json::Error> {
    let mut raw: serde_json::Value = serde_json::from_slice(payload)?;
    if let Some(envelope) = raw.as_object_mut() {
        let ip = envelope
            .get("source")
            .and_then(|s| s.get("ip"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .or_else(|| source.ip.clone());
        let stamped = Source { vendor: source.vendor.clone(), protocol: source.protocol.clone(), ip };
        envelope.insert("source".into(), serde_json::to_value(stamped)?);
    }

    let mut event: MachineEvent = serde_json::from_value(raw)?;
    if event.machine_id.as_deref().map_or(true, str::is_empty) {
        event.machine_id = Some(machine_id.to_string());
    }
    Ok(event)
}

struct Subscription {
    machine_id: String,
    source: Source,
    host: String,
    port: u16,
    topic: String,
    link: Arc<LinkState>,
    sender: mpsc::Sender<MachineEvent>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Reconnects until cancelled or the consumer side goes away
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.session().await {
                Ok(()) => break,
                Err(e) => {
                    self.link.connected.store(false, Ordering::SeqCst);
                    *self.link.last_error.lock() = Some(e.clone());
                    warn!(machine_id = %self.machine_id, error = %e, "bridge connection lost, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }
        self.link.connected.store(false, Ordering::SeqCst);
        debug!(machine_id = %self.machine_id, "bridge subscriber stopped");
    }

    async fn session(&self) -> Result<(), String> {
        let client_id = format!("cellgate-bridge-{}", self.machine_id);
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        client
            .subscribe(&self.topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| format!("subscribe failed: {e}"))?;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = client.disconnect().await;
                    return Ok(());
                }
                polled = eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        self.link.connected.store(true, Ordering::SeqCst);
                        info!(machine_id = %self.machine_id, topic = %self.topic, "bridge connected");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match decode(&publish.payload, &self.machine_id, &self.source) {
                            Ok(event) => {
                                if self.sender.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                self.link.malformed.fetch_add(1, Ordering::Relaxed);
                                warn!(machine_id = %self.machine_id, error = %e, "malformed payload skipped");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e.to_string()),
                }
            }
        }
    }
}

#[async_trait]
impl ConnectorAdapter for MqttBridgeAdapter {
    fn machine_id(&self) -> &str {
        &self.machine_id
    }

    fn source(&self) -> &Source {
        &self.source
    }

    async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        let subscription = Subscription {
            machine_id: self.machine_id.clone(),
            source: self.source.clone(),
            host: self.host.clone(),
            port: self.port,
            topic: self.topic.clone(),
            link: Arc::clone(&self.link),
            sender,
            cancel: self.cancel.clone(),
        };
        tokio::spawn(subscription.run());
    }

    async fn stop(&self) {
        self.cancel.cancel();
        // drop the sender if start() never ran so the stream can end
        self.sender.lock().take();
    }

    async fn check_health(&self) -> AdapterHealth {
        if self.cancel.is_cancelled() {
            return AdapterHealth::unhealthy("stopped");
        }
        if !self.started.load(Ordering::SeqCst) {
            return AdapterHealth::unhealthy("not started");
        }
        if self.link.connected.load(Ordering::SeqCst) {
            let malformed = self.link.malformed.load(Ordering::Relaxed);
            AdapterHealth::healthy(format!("subscribed to {} ({} malformed payloads)", self.topic, malformed))
        } else {
            let reason = self
                .link
                .last_error
                .lock()
                .clone()
                .unwrap_or_else(|| format!("connecting to {}:{}", self.host, self.port));
            AdapterHealth::unhealthy(reason)
        }
    }

    fn events(&self) -> BoxStream<'static, MachineEvent> {
        match self.receiver.lock().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                let event = rx.recv().await?;
                Some((event, rx))
            })
            .boxed(),
            None => {
                warn!(machine_id = %self.machine_id, "event stream already taken");
                stream::empty().boxed()
            }
        }
    }
}
