// src/main.rs
use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fakedata_relay::broker::AmqpConnector;
use fakedata_relay::{Payload, Relay, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::load().context("Failed to load configuration")?;
    let payload = Payload::load(&config.filename).context("Failed to load reply payload")?;

    info!(
        endpoint = %config.endpoint(),
        exchange = %config.rabbitmq.queries.exchange,
        queue = %config.rabbitmq.queries.queue,
        routing_key = %config.rabbitmq.queries.routing_key,
        retry_interval_ms = config.rabbitmq.timeout_ms,
        "starting fakedata relay"
    );

    let connector = AmqpConnector::new(config.amqp_uri(), config.endpoint());
    let relay = Relay::from_config(connector, &config, payload);

    // Runs until the process is killed; returning at all means a task failed.
    if let Err(e) = relay.run().await {
        error!("Relay stopped: {}", e);
        return Err(e).context("Relay failed");
    }
    Ok(())
}
