//! Traffic counter - windowed, deduplicated vehicle counts from tracker output
//!
//! Subscribes to tracked-object frames over MQTT and emits one count snapshot
//! per window. Track IDs seen in recent windows are not counted again.
//!
//! Module structure:
//! - `domain/` - Core types (Category, ObservationBatch, CountSnapshot)
//! - `io/` - External interfaces (MQTT ingest/egress, JSONL egress, Prometheus)
//! - `services/` - Counting logic (WindowedCategoryCounter, CountAggregator)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use traffic_counter::infra::{Config, Metrics};
use traffic_counter::io::{create_egress_channel, MqttPublisher};
use traffic_counter::services::CountAggregator;

/// Traffic counter - per-category vehicle counts per time window
#[derive(Parser, Debug)]
#[command(name = "traffic-counter", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "traffic-counter starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_topic = %config.mqtt_topic(),
        window_ms = %config.window_ms(),
        retention_windows = %config.retention_windows(),
        clock = %config.clock_mode().as_str(),
        categories = ?config.categories(),
        class_codes = %config.category_map().len(),
        egress_file = %config.egress_file(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Bounded ingest channel; the MQTT client holds the only sender
    let (batch_tx, batch_rx) = mpsc::channel(config.channel_capacity());

    let mqtt_config = config.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = traffic_counter::io::mqtt::start_mqtt_client(
            &mqtt_config,
            batch_tx,
            mqtt_metrics,
            mqtt_shutdown,
        )
        .await
        {
            tracing::error!(error = %e, "MQTT client error");
        }
    });

    // Prometheus endpoint (disabled when port is 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = traffic_counter::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // The publisher runs until every sender is dropped: the metrics task drops
    // its clone on shutdown and the aggregator drops its own after the final
    // flush, so the last snapshot is still published.
    let (egress_sender, publisher_handle) = if config.mqtt_egress_enabled() {
        let (egress_sender, egress_rx) = create_egress_channel(1000, config.site_id().to_string());

        let publisher = MqttPublisher::new(&config, egress_rx);
        let publisher_handle = tokio::spawn(publisher.run());

        tokio::spawn(egress_sender.clone().run_metrics_publisher(
            metrics.clone(),
            config.mqtt_egress_metrics_interval_secs(),
            shutdown_rx.clone(),
        ));

        (Some(egress_sender), Some(publisher_handle))
    } else {
        (None, None)
    };

    let mut aggregator = CountAggregator::new(&config, metrics, egress_sender);
    info!("count_aggregator_started");

    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Returns once the MQTT client stops and drops the ingest sender
    aggregator.run(batch_rx).await;
    drop(aggregator);

    if let Some(handle) = publisher_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "MQTT egress publisher error");
        }
    }

    info!("traffic-counter shutdown complete");
    Ok(())
}
