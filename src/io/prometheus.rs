//! Prometheus metrics HTTP endpoint
//!
//! Exposes counter metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::domain::types::Category;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
///
/// Reads cumulative values so scrapes never reset the periodic log report.
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.scrape();
    let mut output = String::with_capacity(4096);

    write_ingest_metrics(&mut output, site_id, &summary);
    write_window_metrics(&mut output, site_id, &summary);
    write_category_metrics(&mut output, site_id, &summary);

    output
}

fn write_ingest_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "traffic_observations_total",
        "Observations applied to the counter",
        MetricType::Counter,
        site,
        summary.observations_total,
    );
    write_metric(
        output,
        "traffic_observations_ignored_total",
        "Tracked objects with an unrecognized class",
        MetricType::Counter,
        site,
        summary.observations_ignored,
    );
    write_metric(
        output,
        "traffic_batches_total",
        "Tracker frames processed",
        MetricType::Counter,
        site,
        summary.batches_total,
    );
    write_metric(
        output,
        "traffic_batches_dropped_total",
        "Tracker frames dropped because the ingest queue was full",
        MetricType::Counter,
        site,
        summary.batches_dropped,
    );
    write_metric(
        output,
        "traffic_messages_invalid_total",
        "Tracker messages that failed to parse",
        MetricType::Counter,
        site,
        summary.messages_invalid,
    );
    write_metric(
        output,
        "traffic_ingest_queue_depth",
        "Current ingest queue depth",
        MetricType::Gauge,
        site,
        summary.ingest_queue_depth,
    );
    write_histogram(
        output,
        "traffic_batch_latency_us",
        "Frame processing latency in microseconds",
        site,
        &summary.batch_lat_buckets,
        summary.batch_lat_sum_us,
    );
}

fn write_window_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "traffic_windows_flushed_total",
        "Count windows flushed",
        MetricType::Counter,
        site,
        summary.windows_flushed,
    );
    write_histogram(
        output,
        "traffic_flush_latency_us",
        "Window flush latency in microseconds",
        site,
        &summary.flush_lat_buckets,
        summary.flush_lat_sum_us,
    );
    write_metric(
        output,
        "traffic_history_windows",
        "Past windows retained for deduplication",
        MetricType::Gauge,
        site,
        summary.history_len,
    );
    write_metric(
        output,
        "traffic_current_window_ids",
        "Distinct track IDs in the open window",
        MetricType::Gauge,
        site,
        summary.current_window_ids,
    );
    write_metric(
        output,
        "traffic_last_window_total",
        "Entities counted in the most recent window",
        MetricType::Gauge,
        site,
        summary.last_window_total,
    );
    write_metric(
        output,
        "traffic_egress_failures_total",
        "Snapshot egress writes that failed",
        MetricType::Counter,
        site,
        summary.egress_failures,
    );
}

fn write_category_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let _ = writeln!(output, "# HELP traffic_counted_total Entities counted per category");
    let _ = writeln!(output, "# TYPE traffic_counted_total counter");
    for category in Category::ALL {
        let _ = writeln!(
            output,
            "traffic_counted_total{{site=\"{site}\",category=\"{}\"}} {}",
            category.as_str(),
            summary.counted(category)
        );
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
        }
        (&Method::GET, "/health") => {
            Response::builder().status(StatusCode::OK).body(Full::new(Bytes::from("ok")))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found"))),
    };

    Ok(response.unwrap_or_else(|e| {
        error!(error = %e, "prometheus_response_build_failed");
        Response::new(Full::new(Bytes::new()))
    }))
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
