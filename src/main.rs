//! realtime-link entry point.
//!
//! Connects to the configured broker, mirrors every configured topic into a
//! live dataset, and logs connection events until interrupted.

use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use realtime_link::config::{ConnectionOptions, LinkConfig};
use realtime_link::domain::EventBus;
use realtime_link::service::{ConnectionManager, LiveDataSet};

const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config =
        LinkConfig::from_env().map_err(|err| anyhow::anyhow!("invalid configuration: {err}"))?;
    tracing::info!(url = %config.connection.url, topics = ?config.topics, "starting realtime-link");

    let manager = ConnectionManager::new(EventBus::new(config.event_bus_capacity));
    let mut events = manager.events();
    let id = config.connection_id.as_str();

    manager
        .create_connection(
            id,
            &config.connection_name,
            config.connection.clone(),
            &ConnectionOptions::default(),
        )
        .await?;
    manager
        .connect(id)
        .await
        .with_context(|| format!("connecting to {}", config.connection.url))?;

    let mut datasets: Vec<LiveDataSet> = Vec::with_capacity(config.topics.len());
    for topic in &config.topics {
        let dataset = manager
            .subscribe_dataset(id, topic, &config.key_field, config.throttle)
            .await
            .with_context(|| format!("subscribing to {topic}"))?;
        datasets.push(dataset);
    }

    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("waiting for ctrl-c")?;
                tracing::info!("shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => tracing::info!(
                    connection_id = event.connection_id(),
                    event = event.event_type_str(),
                    "connection event"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event log lagging");
                }
                Err(RecvError::Closed) => break,
            },
            _ = stats_tick.tick() => {
                let stats = manager.get_statistics().await;
                tracing::info!(
                    active = stats.active_connections,
                    subscriptions = stats.total_subscriptions,
                    received = stats.messages_received,
                    reconnects = stats.reconnect_count,
                    errors = stats.error_count,
                    "statistics"
                );
                for dataset in &datasets {
                    let data = dataset.statistics();
                    tracing::info!(
                        topic = dataset.topic(),
                        rows = data.row_count,
                        updates = data.total_updates,
                        per_second = data.updates_per_second,
                        "dataset"
                    );
                }
            }
        }
    }

    if let Err(err) = manager.disconnect(id).await {
        tracing::warn!(error = %err, "disconnect failed");
    }
    manager.shutdown().await;
    Ok(())
}
