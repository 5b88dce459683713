/**
 * CELLGATE EDGE - Entry point of the gateway process
 *
 * Loads the configuration, builds the gateway with the built-in adapters and the MQTT hub
 * transport, runs until SIGINT/SIGTERM, then shuts down in order.
 */

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cellgate_edge::adapters::AdapterRegistry;
use cellgate_edge::config::load_config;
use cellgate_edge::uplink::mqtt::MqttHubTransport;
use cellgate_edge::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cellgate_edge=info")),
        )
        .init();

    let config = load_config().await.context("failed to load gateway configuration")?;
    let transport = MqttHubTransport::from_config(&config.site_id, &config.transport)
        .with_context(|| format!("invalid hub url {}", config.transport.hub_url))?;
    info!(site_id = %config.site_id, hub = %config.transport.hub_url, topic = %transport.topic(), "starting gateway");

    let gateway = Gateway::build(config, AdapterRegistry::with_builtin(), Box::new(transport))
        .await
        .context("failed to build gateway")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(shutdown.clone());

    let health = gateway.run(shutdown).await;
    info!(
        events_sent = health.uplink.events_sent,
        batches_spooled = health.uplink.batches_spooled,
        "bye"
    );
    Ok(())
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received SIGINT");
                ctrl_c.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM");
                token.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for SIGTERM"),
        }
    });
}
