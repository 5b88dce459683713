/*!
In-memory hub for tests without a broker

Records every batch it acknowledges. `set_failing(true)` makes sends fail so the uplink
spools; `set_refusing(true)` makes connects fail.
*/

use async_trait::async_trait;
use cellgate_edge::models::Batch;
use cellgate_edge::uplink::{HubTransport, UplinkError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Default)]
pub struct MockHubTransport {
    received: Arc<Mutex<Vec<Batch>>>,
    sessions: Arc<Mutex<Vec<String>>>,
    connected: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
    refusing: Arc<AtomicBool>,
    failed_sends: Arc<AtomicUsize>,
}

impl MockHubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub that never acknowledges
    pub fn failing() -> Self {
        let hub = Self::new();
        hub.set_failing(true);
        hub
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Batches acknowledged so far, in arrival order
    pub fn get_batches(&self) -> Vec<Batch> {
        self.received.lock().clone()
    }

    pub fn events_received(&self) -> usize {
        self.received.lock().iter().map(|b| b.events.len()).sum()
    }

    /// Session ids of every successful connect
    pub fn sessions(&self) -> Vec<String> {
        self.sessions.lock().clone()
    }

    pub fn failed_sends(&self) -> usize {
        self.failed_sends.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.received.lock().clear();
        self.sessions.lock().clear();
        self.failed_sends.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl HubTransport for MockHubTransport {
    async fn connect(&mut self, session_id: &str) -> Result<(), UplinkError> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(UplinkError::Connect("mock hub refuses connections".into()));
        }
        self.sessions.lock().push(session_id.to_string());
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&mut self, batch: &Batch, payload: &[u8]) -> Result<(), UplinkError> {
        if self.failing.load(Ordering::SeqCst) {
            self.failed_sends.fetch_add(1, Ordering::SeqCst);
            return Err(UplinkError::Send("mock hub unavailable".into()));
        }
        // decode the wire bytes so tests see exactly what a real hub would
        let decoded: Batch = serde_json::from_slice(payload)?;
        info!(batch_id = %batch.batch_id, events = decoded.events.len(), "[MOCK] batch acknowledged");
        self.received.lock().push(decoded);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventBuilder;

    #[tokio::test]
    async fn test_records_decoded_batches() {
        let hub = MockHubTransport::new();
        let mut transport = hub.clone();
        transport.connect("s-1").await.unwrap();

        let batch = Batch::new("site-a", vec![EventBuilder::new("m-1").build(), EventBuilder::new("m-2").build()]);
        transport.send(&batch, &batch.to_bytes().unwrap()).await.unwrap();

        assert_eq!(hub.get_batches(), vec![batch]);
        assert_eq!(hub.events_received(), 2);
        assert_eq!(hub.sessions(), vec!["s-1".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_and_refusing_modes() {
        let hub = MockHubTransport::failing();
        let mut transport = hub.clone();
        transport.connect("s-1").await.unwrap();

        let batch = Batch::new("site-a", vec![EventBuilder::new("m-1").build()]);
        assert!(transport.send(&batch, &batch.to_bytes().unwrap()).await.is_err());
        assert_eq!(hub.failed_sends(), 1);

        hub.set_refusing(true);
        transport.disconnect().await;
        assert!(matches!(transport.connect("s-2").await, Err(UplinkError::Connect(_))));
        assert!(!transport.is_connected());
    }
}
