//! MQTT hub transport.
//!
//! Batches are published QoS 1 on `cellgate/sites/{siteId}/batches@v1`; the broker PUBACK
//! is the hub acknowledgment. A driver task owns the rumqttc event loop and forwards
//! CONNACK/PUBACK to the transport over channels.

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{HubTransport, UplinkError};
use crate::config::TransportConfig;
use crate::models::Batch;

pub const DEFAULT_PORT: u16 = 1883;

/// Topic batches for `site_id` are published on
pub fn batch_topic(site_id: &str) -> String {
    format!("cellgate/sites/{site_id}/batches@v1")
}

/// Accepts `mqtt://host:port`, `tcp://host:port` or bare `host[:port]`
pub fn parse_broker_url(url: &str) -> Result<(&str, u16), UplinkError> {
    let rest = url.trim();
    let rest = rest.strip_prefix("mqtt://").or_else(|| rest.strip_prefix("tcp://")).unwrap_or(rest);
    let rest = rest.trim_end_matches('/');

    let parts: Vec<&str> = rest.split(':').collect();
    match parts.as_slice() {
        [host] if !host.is_empty() => Ok((host, DEFAULT_PORT)),
        [host, port] if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| UplinkError::InvalidUrl(format!("invalid port in {url}")))?;
            Ok((host, port))
        }
        _ => Err(UplinkError::InvalidUrl(url.to_string())),
    }
}

/// Live MQTT session
struct Session {
    client: AsyncClient,
    acks: mpsc::UnboundedReceiver<u16>,
    stop: CancellationToken,
    driver: JoinHandle<()>,
}

pub struct MqttHubTransport {
    site_id: String,
    host: String,
    port: u16,
    topic: String,
    max_packet_size: usize,
    connect_timeout: Duration,
    ack_timeout: Duration,
    connected: Arc<AtomicBool>,
    session: Option<Session>,
}

impl MqttHubTransport {
    pub fn from_config(site_id: &str, config: &TransportConfig) -> Result<Self, UplinkError> {
        let (host, port) = parse_broker_url(&config.hub_url)?;
        Ok(Self {
            site_id: site_id.to_string(),
            host: host.to_string(),
            port,
            topic: batch_topic(site_id),
            // a batch may overshoot maxBytes by one event
            max_packet_size: config.batch.max_bytes.saturating_mul(2).max(64 * 1024),
            connect_timeout: config.connect_timeout(),
            ack_timeout: config.ack_timeout(),
            connected: Arc::new(AtomicBool::new(false)),
            session: None,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.client.try_disconnect();
            session.stop.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(1), session.driver).await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Polls the event loop until stopped or the connection drops
async fn drive(
    mut eventloop: rumqttc::EventLoop,
    connected: Arc<AtomicBool>,
    mut connack: Option<oneshot::Sender<Result<(), String>>>,
    acks: mpsc::UnboundedSender<u16>,
    stop: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = stop.cancelled() => break,
            polled = eventloop.poll() => polled,
        };
        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let result = if ack.code == ConnectReturnCode::Success {
                    connected.store(true, Ordering::SeqCst);
                    Ok(())
                } else {
                    Err(format!("broker refused connection: {:?}", ack.code))
                };
                let refused = result.is_err();
                if let Some(tx) = connack.take() {
                    let _ = tx.send(result);
                }
                if refused {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                if acks.send(ack.pkid).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "hub event loop ended");
                if let Some(tx) = connack.take() {
                    let _ = tx.send(Err(e.to_string()));
                }
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

#[async_trait]
impl HubTransport for MqttHubTransport {
    #[instrument(skip(self))]
    async fn connect(&mut self, session_id: &str) -> Result<(), UplinkError> {
        self.close_session().await;

        let client_id = format!("cellgate-edge-{}-{}", self.site_id, session_id);
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        options.set_max_packet_size(self.max_packet_size, self.max_packet_size);

        let (client, eventloop) = AsyncClient::new(options, 10);
        let (connack_tx, connack_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let driver = tokio::spawn(drive(
            eventloop,
            Arc::clone(&self.connected),
            Some(connack_tx),
            ack_tx,
            stop.clone(),
        ));

        self.session = Some(Session { client, acks: ack_rx, stop, driver });

        let outcome = match tokio::time::timeout(self.connect_timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(UplinkError::Connect(reason)),
            Ok(Err(_)) => Err(UplinkError::Connect("event loop stopped".into())),
            Err(_) => Err(UplinkError::Connect(format!("no CONNACK within {:?}", self.connect_timeout))),
        };
        if outcome.is_err() {
            self.close_session().await;
        }
        outcome
    }

    async fn send(&mut self, batch: &Batch, payload: &[u8]) -> Result<(), UplinkError> {
        if !self.is_connected() {
            return Err(UplinkError::NotConnected);
        }
        let session = self.session.as_mut().ok_or(UplinkError::NotConnected)?;

        // one batch in flight: anything already queued belongs to an older publish
        while session.acks.try_recv().is_ok() {}

        session
            .client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|e| UplinkError::Send(e.to_string()))?;

        match tokio::time::timeout(self.ack_timeout, session.acks.recv()).await {
            Ok(Some(pkid)) => {
                debug!(batch_id = %batch.batch_id, pkid, "PUBACK received");
                Ok(())
            }
            Ok(None) => Err(UplinkError::Send("connection closed before PUBACK".into())),
            Err(_) => {
                warn!(batch_id = %batch.batch_id, "hub did not acknowledge batch");
                Err(UplinkError::AckTimeout(self.ack_timeout))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.session.is_some() && self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&mut self) {
        self.close_session().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(parse_broker_url("mqtt://hub.local:8883").unwrap(), ("hub.local", 8883));
        assert_eq!(parse_broker_url("tcp://10.0.0.5:1884").unwrap(), ("10.0.0.5", 1884));
        assert_eq!(parse_broker_url("broker").unwrap(), ("broker", DEFAULT_PORT));
        assert_eq!(parse_broker_url("mqtt://broker/").unwrap(), ("broker", DEFAULT_PORT));
    }

    #[test]
    fn test_parse_broker_url_rejects_garbage() {
        assert!(matches!(parse_broker_url("mqtt://a:b:c"), Err(UplinkError::InvalidUrl(_))));
        assert!(matches!(parse_broker_url("mqtt://host:notaport"), Err(UplinkError::InvalidUrl(_))));
        assert!(matches!(parse_broker_url("mqtt://"), Err(UplinkError::InvalidUrl(_))));
    }

    #[test]
    fn test_topic_and_initial_state() {
        let config = TransportConfig { hub_url: "mqtt://hub:1883".into(), ..Default::default() };
        let transport = MqttHubTransport::from_config("plant-7", &config).unwrap();
        assert_eq!(transport.topic(), "cellgate/sites/plant-7/batches@v1");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_without_connection_fails_fast() {
        let config = TransportConfig { hub_url: "mqtt://hub:1883".into(), ..Default::default() };
        let mut transport = MqttHubTransport::from_config("plant-7", &config).unwrap();
        let batch = Batch::new("plant-7", Vec::new());
        assert!(matches!(transport.send(&batch, b"{}").await, Err(UplinkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let config = TransportConfig {
            hub_url: "mqtt://127.0.0.1:1".into(),
            connect_timeout_ms: 2_000,
            ..Default::default()
        };
        let mut transport = MqttHubTransport::from_config("plant-7", &config).unwrap();
        assert!(matches!(transport.connect("s-1").await, Err(UplinkError::Connect(_))));
        assert!(!transport.is_connected());
    }
}
