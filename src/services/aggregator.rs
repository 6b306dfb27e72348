//! Count aggregation actor
//!
//! Owns the windowed counter, applies observation batches from the ingest
//! channel, and decides when a window closes. Every closed window is logged,
//! written to the JSONL egress, published to MQTT when enabled, and recorded
//! in metrics.

use crate::domain::snapshot::{epoch_ms, CountSnapshot};
use crate::domain::types::{Category, ObservationBatch};
use crate::infra::config::{ClockMode, Config};
use crate::infra::metrics::Metrics;
use crate::io::egress::Egress;
use crate::io::EgressSender;
use crate::services::counter::WindowedCategoryCounter;
use crate::services::window_clock::WindowClock;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Single owner of counter state
pub struct CountAggregator {
    /// Deduplicating counter
    counter: WindowedCategoryCounter,
    /// Window cadence source
    clock_mode: ClockMode,
    /// Boundary detection for stream time
    window_clock: WindowClock,
    /// Latest frame time applied, used to stamp the final stream flush
    last_frame_ms: Option<u64>,
    /// Writes snapshots to file
    egress: Egress,
    /// Metrics collector
    metrics: Arc<Metrics>,
    /// MQTT egress sender (optional)
    egress_sender: Option<EgressSender>,
}

impl CountAggregator {
    pub fn new(config: &Config, metrics: Arc<Metrics>, egress_sender: Option<EgressSender>) -> Self {
        let egress = Egress::new(config.egress_file()).with_site(config.site_id());
        Self::with_egress(config, metrics, egress, egress_sender)
    }

    /// Create an aggregator with an explicit egress writer
    pub fn with_egress(
        config: &Config,
        metrics: Arc<Metrics>,
        egress: Egress,
        egress_sender: Option<EgressSender>,
    ) -> Self {
        let counter = WindowedCategoryCounter::new(config.categories(), config.retention_windows());
        info!(
            window_ms = %config.window_ms(),
            retention = %config.retention_windows(),
            clock = %config.clock_mode().as_str(),
            categories = ?counter.tracked_categories(),
            "count_aggregator_initialized"
        );
        Self {
            counter,
            clock_mode: config.clock_mode(),
            window_clock: WindowClock::new(config.window_ms()),
            last_frame_ms: None,
            egress,
            metrics,
            egress_sender,
        }
    }

    /// Run the aggregation loop until the batch channel closes
    ///
    /// The last partial window is flushed before returning.
    pub async fn run(&mut self, mut batch_rx: mpsc::Receiver<ObservationBatch>) {
        match self.clock_mode {
            ClockMode::Wall => self.run_wall(&mut batch_rx).await,
            ClockMode::Stream => {
                while let Some(batch) = batch_rx.recv().await {
                    self.metrics.set_ingest_queue_depth(batch_rx.len() as u64);
                    self.process_batch(batch);
                }
            }
        }

        info!("count_aggregator_channel_closed");
        self.finish();
    }

    async fn run_wall(&mut self, batch_rx: &mut mpsc::Receiver<ObservationBatch>) {
        let period = Duration::from_millis(self.window_clock.window_ms());
        // First tick one full window from now
        let mut flush_interval = interval_at(tokio::time::Instant::now() + period, period);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                batch = batch_rx.recv() => {
                    match batch {
                        Some(batch) => {
                            self.metrics.set_ingest_queue_depth(batch_rx.len() as u64);
                            self.apply_batch(&batch);
                        }
                        None => break,
                    }
                }
                _ = flush_interval.tick() => {
                    self.flush_and_egress(epoch_ms());
                }
            }
        }
    }

    /// Apply one batch, closing the current window first if stream time says so
    ///
    /// Returns the snapshot of the window closed by this batch, if any. In
    /// wall mode batches never close windows.
    pub fn process_batch(&mut self, batch: ObservationBatch) -> Option<CountSnapshot> {
        let mut flushed = None;

        if self.clock_mode == ClockMode::Stream {
            if self.window_clock.poll(batch.frame_time_ms) {
                flushed = Some(self.flush_and_egress(batch.frame_time_ms));
            }
            if self.last_frame_ms.map_or(true, |last| batch.frame_time_ms > last) {
                self.last_frame_ms = Some(batch.frame_time_ms);
            }
        }

        self.apply_batch(&batch);
        flushed
    }

    fn apply_batch(&mut self, batch: &ObservationBatch) {
        let start = Instant::now();

        let mut accepted = 0u64;
        for obs in &batch.observations {
            if self.counter.observe(obs.track_id, obs.category) {
                accepted += 1;
            }
        }
        let untracked = batch.len() as u64 - accepted;
        if untracked > 0 {
            self.metrics.record_observations_ignored(untracked);
        }

        self.metrics.set_current_window_ids(self.counter.current_distinct() as u64);

        // Latency measured from MQTT receipt so queueing time is included
        let latency_us = batch.received_at.elapsed().as_micros() as u64;
        self.metrics.record_batch_processed(accepted, latency_us);

        debug!(
            frame_time_ms = %batch.frame_time_ms,
            accepted = %accepted,
            untracked = %untracked,
            apply_us = %start.elapsed().as_micros(),
            "batch_applied"
        );
    }

    /// Close the current window and hand its snapshot to every sink
    pub fn flush_and_egress(&mut self, now: u64) -> CountSnapshot {
        let start = Instant::now();
        let snapshot = self.counter.flush(now);

        info!(
            id = %snapshot.id,
            window = %snapshot.window,
            ts = %snapshot.ts,
            total = %snapshot.total(),
            counts = %snapshot.to_json(),
            "snapshot_emitted"
        );

        if !self.egress.write_snapshot(&snapshot) {
            self.metrics.record_egress_failure();
        }

        if let Some(ref sender) = self.egress_sender {
            if !sender.send_snapshot(&snapshot) {
                warn!(id = %snapshot.id, "mqtt_egress_snapshot_dropped");
            }
        }

        let counts: SmallVec<[(Category, u64); 5]> =
            snapshot.counts.iter().map(|(c, n)| (*c, *n)).collect();
        let latency_us = start.elapsed().as_micros() as u64;
        self.metrics.record_flush(&counts, self.counter.history_len(), latency_us);

        snapshot
    }

    /// Flush the last partial window
    ///
    /// Stream mode stamps it with the latest frame time and skips the flush
    /// when no frame was ever seen.
    pub fn finish(&mut self) -> Option<CountSnapshot> {
        let now = match self.clock_mode {
            ClockMode::Wall => epoch_ms(),
            ClockMode::Stream => self.last_frame_ms?,
        };
        info!(window = %(self.counter.windows_flushed() + 1), "count_aggregator_final_flush");
        Some(self.flush_and_egress(now))
    }

    pub fn counter(&self) -> &WindowedCategoryCounter {
        &self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::egress_channel::{create_egress_channel, EgressMessage};
    use std::fs;
    use tempfile::tempdir;

    fn stream_config(file: &str, window_ms: u64, retention: usize) -> Config {
        Config::default()
            .with_clock_mode(ClockMode::Stream)
            .with_egress_file(file)
            .with_window(window_ms, retention)
    }

    fn batch(frame_time_ms: u64, observations: &[(i64, Category)]) -> ObservationBatch {
        observations
            .iter()
            .fold(ObservationBatch::new(frame_time_ms), |b, (id, c)| b.with_observation(*id, *c))
    }

    fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_stream_batches_close_windows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counts.jsonl");
        let config = stream_config(path.to_str().unwrap(), 1000, 60);
        let metrics = Arc::new(Metrics::new());
        let mut agg = CountAggregator::new(&config, metrics.clone(), None);

        assert!(agg.process_batch(batch(0, &[(1, Category::Car), (2, Category::Bus)])).is_none());
        assert!(agg.process_batch(batch(500, &[(1, Category::Car)])).is_none());

        let first = agg.process_batch(batch(1000, &[(1, Category::Car), (3, Category::Truck)]));
        let first = first.unwrap();
        assert_eq!(first.ts, 1000);
        assert_eq!(first.count(Category::Car), 1);
        assert_eq!(first.count(Category::Bus), 1);
        assert_eq!(first.count(Category::Truck), 0);

        let second = agg.process_batch(batch(2000, &[])).unwrap();
        // Id 1 was counted in window 1; id 3 is new
        assert_eq!(second.count(Category::Car), 0);
        assert_eq!(second.count(Category::Truck), 1);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["car"], 1);
        assert_eq!(lines[0]["site"], "traffic");
        assert_eq!(lines[1]["truck"], 1);

        assert_eq!(metrics.windows_flushed(), 2);
        assert_eq!(metrics.counted(Category::Car), 1);
        assert_eq!(metrics.counted(Category::Truck), 1);
        assert_eq!(metrics.observations_total(), 5);
    }

    #[test]
    fn test_finish_without_frames_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counts.jsonl");
        let config = stream_config(path.to_str().unwrap(), 1000, 60);
        let mut agg = CountAggregator::new(&config, Arc::new(Metrics::new()), None);

        assert!(agg.finish().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_egress_failure_recorded() {
        let dir = tempdir().unwrap();
        let config = stream_config(dir.path().to_str().unwrap(), 1000, 60);
        let metrics = Arc::new(Metrics::new());
        let mut agg = CountAggregator::new(&config, metrics.clone(), None);

        agg.process_batch(batch(0, &[(1, Category::Car)]));
        let snapshot = agg.flush_and_egress(1000);

        // Snapshot still produced and counter state advanced
        assert_eq!(snapshot.count(Category::Car), 1);
        assert_eq!(agg.counter().history_len(), 1);
        assert_eq!(metrics.report().egress_failures, 1);
    }

    #[tokio::test]
    async fn test_run_stream_final_flush_on_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counts.jsonl");
        let config = stream_config(path.to_str().unwrap(), 1000, 60);
        let metrics = Arc::new(Metrics::new());
        let (egress_sender, mut egress_rx) = create_egress_channel(16, "junction-4".to_string());
        let mut agg = CountAggregator::new(&config, metrics.clone(), Some(egress_sender));

        let (tx, rx) = mpsc::channel(16);
        tx.send(batch(0, &[(1, Category::Car)])).await.unwrap();
        tx.send(batch(1200, &[(2, Category::Motorcycle), (1, Category::Car)])).await.unwrap();
        tx.send(batch(1800, &[(4, Category::Bicycle)])).await.unwrap();
        drop(tx);

        agg.run(rx).await;

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["car"], 1);
        assert_eq!(lines[0]["ts"], 1200);
        // Final partial window stamped with the latest frame time
        assert_eq!(lines[1]["motorcycle"], 1);
        assert_eq!(lines[1]["bicycle"], 1);
        assert_eq!(lines[1]["car"], 0);
        assert_eq!(lines[1]["ts"], 1800);

        let mut published = 0;
        while let Ok(msg) = egress_rx.try_recv() {
            match msg {
                EgressMessage::Counts(payload) => {
                    assert!(payload.json.contains("\"site\":\"junction-4\""));
                    published += 1;
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(published, 2);
        assert_eq!(metrics.windows_flushed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_wall_flushes_on_interval() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counts.jsonl");
        let config = Config::default()
            .with_egress_file(path.to_str().unwrap())
            .with_window(1000, 60);
        let metrics = Arc::new(Metrics::new());
        let mut agg = CountAggregator::new(&config, metrics.clone(), None);

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(async move {
            agg.run(rx).await;
            agg
        });

        tx.send(batch(0, &[(1, Category::Car), (2, Category::Car)])).await.unwrap();
        tokio::task::yield_now().await;
        // One interval tick closes the first window
        tokio::time::advance(Duration::from_millis(1500)).await;
        tokio::task::yield_now().await;
        tx.send(batch(0, &[(1, Category::Car), (3, Category::Bus)])).await.unwrap();
        drop(tx);

        let agg = handle.await.unwrap();
        assert_eq!(agg.counter().windows_flushed(), 2);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["car"], 2);
        assert_eq!(lines[1]["car"], 0);
        assert_eq!(lines[1]["bus"], 1);
    }

    #[tokio::test]
    async fn test_final_snapshot_published_before_egress_closes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counts.jsonl");
        let config = stream_config(path.to_str().unwrap(), 1000, 60);
        let metrics = Arc::new(Metrics::new());
        let (egress_sender, mut egress_rx) = create_egress_channel(16, "junction-4".to_string());
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let metrics_task = tokio::spawn(egress_sender.clone().run_metrics_publisher(
            metrics.clone(),
            3600,
            shutdown_rx,
        ));
        let mut agg = CountAggregator::new(&config, metrics.clone(), Some(egress_sender));

        let (tx, rx) = mpsc::channel(16);
        tx.send(batch(0, &[(1, Category::Car)])).await.unwrap();

        // Shutdown first, then ingest stops
        shutdown_tx.send(true).unwrap();
        metrics_task.await.unwrap();
        drop(tx);
        agg.run(rx).await;
        drop(agg);

        // Every sender is gone, so the egress channel drains and then closes
        let mut counts = Vec::new();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(msg) = egress_rx.recv().await {
                if let EgressMessage::Counts(payload) = msg {
                    counts.push(payload.json);
                }
            }
        })
        .await;
        assert!(drained.is_ok(), "egress channel never closed");
        assert_eq!(counts.len(), 1);
        assert!(counts[0].contains("\"car\":1"));
    }

    #[test]
    fn test_untracked_observations_counted_as_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counts.jsonl");
        let toml_config = toml::from_str("[counter]\ncategories = [\"car\"]\nclock = \"stream\"").unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string())
            .unwrap()
            .with_egress_file(path.to_str().unwrap());
        let metrics = Arc::new(Metrics::new());
        let mut agg = CountAggregator::new(&config, metrics.clone(), None);

        agg.process_batch(batch(0, &[(1, Category::Car), (2, Category::Truck)]));

        assert_eq!(metrics.observations_total(), 1);
        assert_eq!(metrics.observations_ignored(), 1);
    }
}
