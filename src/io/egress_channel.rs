//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way to send snapshots and metrics to the MQTT
//! publisher. Uses bounded mpsc channels to prevent unbounded memory growth.

use crate::domain::snapshot::{epoch_ms, CountSnapshot};
use crate::domain::types::Category;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_NUM_BUCKETS};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Count snapshot for persistence
    Counts(CountsPayload),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

/// Payload for count snapshots (pre-serialized document)
#[derive(Debug, Serialize)]
pub struct CountsPayload {
    pub json: String,
}

/// Payload for metrics snapshot
#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    /// Site identifier
    pub site: String,
    /// Timestamp (epoch ms)
    pub ts: u64,
    pub observations_total: u64,
    pub observations_ignored: u64,
    pub batches_per_sec: f64,
    pub batches_dropped: u64,
    pub messages_invalid: u64,
    /// Batch latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub batch_lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub batch_lat_p99_us: u64,
    pub windows_flushed: u64,
    pub flush_lat_max_us: u64,
    /// Cumulative counts per category label
    pub counted: BTreeMap<&'static str, u64>,
    pub history_len: u64,
    pub current_window_ids: u64,
    pub egress_failures: u64,
    pub ingest_queue_depth: u64,
}

impl MetricsPayload {
    /// Create a metrics payload from a summary with site info
    pub fn from_summary(summary: MetricsSummary, site: String) -> Self {
        let counted =
            Category::ALL.iter().map(|c| (c.as_str(), summary.counted(*c))).collect();
        Self {
            site,
            ts: epoch_ms(),
            observations_total: summary.observations_total,
            observations_ignored: summary.observations_ignored,
            batches_per_sec: summary.batches_per_sec,
            batches_dropped: summary.batches_dropped,
            messages_invalid: summary.messages_invalid,
            batch_lat_buckets: summary.batch_lat_buckets,
            batch_lat_p99_us: summary.batch_lat_p99_us,
            windows_flushed: summary.windows_flushed,
            flush_lat_max_us: summary.flush_lat_max_us,
            counted,
            history_len: summary.history_len,
            current_window_ids: summary.current_window_ids,
            egress_failures: summary.egress_failures,
            ingest_queue_depth: summary.ingest_queue_depth,
        }
    }
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String) -> Self {
        Self { tx, site_id }
    }

    /// Send a count snapshot for publishing
    /// Includes site_id in the JSON document. Returns false if dropped.
    pub fn send_snapshot(&self, snapshot: &CountSnapshot) -> bool {
        let json = snapshot.to_json_with_site(&self.site_id);
        self.tx.try_send(EgressMessage::Counts(CountsPayload { json })).is_ok()
    }

    /// Send a metrics snapshot
    pub fn send_metrics(&self, summary: MetricsSummary) {
        let payload = MetricsPayload::from_summary(summary, self.site_id.clone());
        let _ = self.tx.try_send(EgressMessage::Metrics(payload));
    }

    /// Publish cumulative metrics every `interval_secs` until shutdown
    ///
    /// Consumes the sender so it is dropped on shutdown, letting the egress
    /// channel close once the aggregator's sender is gone too.
    pub async fn run_metrics_publisher(
        self,
        metrics: Arc<Metrics>,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => self.send_metrics(metrics.scrape()),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("metrics_egress_shutdown");
                        return;
                    }
                }
            }
        }
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// Buffer size determines how many messages can be queued.
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id), rx)
}
