//! Commissioning tool: prints a summary of every batch published by the gateways of a site.
//!
//! `CELLGATE_HUB_URL` selects the broker (default `mqtt://127.0.0.1:1883`), `CELLGATE_SITE_ID`
//! restricts to one site (default: all sites).

use anyhow::{Context, Result};
use cellgate_edge::config::{HUB_URL_ENV, SITE_ID_ENV};
use cellgate_edge::models::Batch;
use cellgate_edge::uplink::mqtt::{batch_topic, parse_broker_url};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const CLIENT_ID: &str = "cellgate-hub-listener";

/// What one batch carried
#[derive(Debug, PartialEq)]
struct BatchSummary {
    site_id: String,
    events: usize,
    per_machine: BTreeMap<String, usize>,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
}

fn summarize(batch: &Batch) -> BatchSummary {
    let mut per_machine = BTreeMap::new();
    for event in &batch.events {
        let machine = event.machine_id.clone().unwrap_or_else(|| "?".into());
        *per_machine.entry(machine).or_insert(0) += 1;
    }
    let stamps = batch.events.iter().map(|e| e.timestamp_utc());
    BatchSummary {
        site_id: batch.site_id.clone(),
        events: batch.events.len(),
        per_machine,
        first: stamps.clone().min(),
        last: stamps.max(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hub_listener=info")))
        .init();

    let hub_url = std::env::var(HUB_URL_ENV).unwrap_or_else(|_| "mqtt://127.0.0.1:1883".into());
    let topic = batch_topic(&std::env::var(SITE_ID_ENV).unwrap_or_else(|_| "+".into()));
    let (host, port) = parse_broker_url(&hub_url).with_context(|| format!("bad hub url {hub_url}"))?;

    let mut options = MqttOptions::new(CLIENT_ID, host, port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_max_packet_size(4 * 1024 * 1024, 64 * 1024);

    let (client, mut eventloop) = AsyncClient::new(options, 10);
    info!(host, port, topic = %topic, "listening for batches");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                // clean session: subscribe again after every reconnect
                client.subscribe(topic.as_str(), QoS::AtLeastOnce).await?;
                debug!(topic = %topic, "subscribed");
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => match serde_json::from_slice::<Batch>(&publish.payload) {
                Ok(batch) => {
                    let summary = summarize(&batch);
                    info!(
                        topic = %publish.topic,
                        site_id = %summary.site_id,
                        batch_id = %batch.batch_id,
                        events = summary.events,
                        machines = ?summary.per_machine,
                        first = ?summary.first,
                        last = ?summary.last,
                        "batch received"
                    );
                }
                Err(e) => warn!(topic = %publish.topic, error = %e, bytes = publish.payload.len(), "undecodable batch"),
            },
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "broker connection error, reconnecting");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellgate_edge::models::{MachineEvent, Source};

    #[test]
    fn test_summary_counts_per_machine() {
        let source = Source { vendor: "SIMULATOR".into(), protocol: "synthetic".into(), ip: None };
        let t0 = Utc::now();
        let events = vec![
            MachineEvent::new("m-2", source.clone(), (t0 + chrono::Duration::seconds(2)).fixed_offset()),
            MachineEvent::new("m-1", source.clone(), t0.fixed_offset()),
            MachineEvent::new("m-2", source, (t0 + chrono::Duration::seconds(1)).fixed_offset()),
        ];
        let summary = summarize(&Batch::new("plant-7", events));

        assert_eq!(summary.events, 3);
        assert_eq!(summary.per_machine.get("m-2"), Some(&2));
        assert_eq!(summary.first, Some(t0));
        assert_eq!(summary.last, Some(t0 + chrono::Duration::seconds(2)));
    }

    #[test]
    fn test_empty_batch() {
        let summary = summarize(&Batch::new("plant-7", Vec::new()));
        assert_eq!(summary.events, 0);
        assert!(summary.first.is_none());
    }
}
