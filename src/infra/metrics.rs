//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! `report()` resets the periodic histograms and belongs to the periodic log
//! line. Every other reader (Prometheus scrapes, MQTT metrics) uses `scrape()`,
//! which reads cumulative values and resets nothing.
//!
//! NOTE: All atomics use Relaxed ordering; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::Category;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Number of category slots
const NUM_CATEGORIES: usize = Category::ALL.len();

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Load all buckets without resetting them
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Observations applied to the counter (monotonic)
    observations_total: AtomicU64,
    /// Tracked objects with an unmapped class or untracked category (monotonic)
    observations_ignored: AtomicU64,
    /// Batches processed (monotonic)
    batches_total: AtomicU64,
    /// Batches since last report (reset on report)
    batches_since_report: AtomicU64,
    /// Sum of batch processing latencies in microseconds (reset on report)
    batch_latency_sum_us: AtomicU64,
    /// Max batch processing latency (reset on report)
    batch_latency_max_us: AtomicU64,
    /// Batch processing latency histogram (reset on report)
    batch_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Batch latency histogram since start (monotonic)
    batch_latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    /// Sum of batch latencies since start (monotonic)
    batch_latency_sum_total_us: AtomicU64,
    /// Batches dropped because the ingest channel was full (monotonic)
    batches_dropped: AtomicU64,
    /// Tracker messages that failed to parse (monotonic)
    messages_invalid: AtomicU64,
    /// Windows flushed (monotonic)
    windows_flushed: AtomicU64,
    /// Flush latency histogram (reset on report)
    flush_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of flush latencies (reset on report)
    flush_latency_sum_us: AtomicU64,
    /// Max flush latency (reset on report)
    flush_latency_max_us: AtomicU64,
    /// Flush latency histogram since start (monotonic)
    flush_latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    /// Sum of flush latencies since start (monotonic)
    flush_latency_sum_total_us: AtomicU64,
    /// Counted entities per category, indexed by `Category::index` (monotonic)
    counted_by_category: [AtomicU64; NUM_CATEGORIES],
    /// Total counted in the most recent window
    last_window_total: AtomicU64,
    /// History length after the most recent flush
    history_len: AtomicU64,
    /// Distinct IDs in the window being accumulated (updated per batch)
    current_window_ids: AtomicU64,
    /// Snapshot egress writes that failed (monotonic)
    egress_failures: AtomicU64,
    /// Current ingest queue depth (updated by sampler)
    ingest_queue_depth: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
    /// Creation time, for lifetime rates in `scrape()`
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            observations_total: AtomicU64::new(0),
            observations_ignored: AtomicU64::new(0),
            batches_total: AtomicU64::new(0),
            batches_since_report: AtomicU64::new(0),
            batch_latency_sum_us: AtomicU64::new(0),
            batch_latency_max_us: AtomicU64::new(0),
            batch_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            batch_latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            batch_latency_sum_total_us: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
            messages_invalid: AtomicU64::new(0),
            windows_flushed: AtomicU64::new(0),
            flush_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            flush_latency_sum_us: AtomicU64::new(0),
            flush_latency_max_us: AtomicU64::new(0),
            flush_latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            flush_latency_sum_total_us: AtomicU64::new(0),
            counted_by_category: std::array::from_fn(|_| AtomicU64::new(0)),
            last_window_total: AtomicU64::new(0),
            history_len: AtomicU64::new(0),
            current_window_ids: AtomicU64::new(0),
            egress_failures: AtomicU64::new(0),
            ingest_queue_depth: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
            started_at: Instant::now(),
        }
    }

    /// Record a batch applied to the counter (lock-free)
    #[inline]
    pub fn record_batch_processed(&self, observations: u64, latency_us: u64) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
        self.batches_since_report.fetch_add(1, Ordering::Relaxed);
        self.observations_total.fetch_add(observations, Ordering::Relaxed);
        self.batch_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        self.batch_latency_sum_total_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.batch_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.batch_latency_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.batch_latency_max_us, latency_us);
    }

    /// Record tracked objects that were filtered out before counting
    #[inline]
    pub fn record_observations_ignored(&self, count: u64) {
        if count > 0 {
            self.observations_ignored.fetch_add(count, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_batch_dropped(&self) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_message_invalid(&self) {
        self.messages_invalid.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a window flush with its per-category counts
    pub fn record_flush(&self, counts: &[(Category, u64)], history_len: usize, latency_us: u64) {
        self.windows_flushed.fetch_add(1, Ordering::Relaxed);
        self.flush_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.flush_latency_sum_total_us.fetch_add(latency_us, Ordering::Relaxed);
        let bucket = bucket_index(latency_us);
        self.flush_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.flush_latency_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.flush_latency_max_us, latency_us);

        let mut total = 0u64;
        for (category, count) in counts {
            self.counted_by_category[category.index()].fetch_add(*count, Ordering::Relaxed);
            total += count;
        }
        self.last_window_total.store(total, Ordering::Relaxed);
        self.history_len.store(history_len as u64, Ordering::Relaxed);
        self.current_window_ids.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_current_window_ids(&self, ids: u64) {
        self.current_window_ids.store(ids, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_egress_failure(&self) {
        self.egress_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_ingest_queue_depth(&self, depth: u64) {
        self.ingest_queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn observations_total(&self) -> u64 {
        self.observations_total.load(Ordering::Relaxed)
    }

    pub fn observations_ignored(&self) -> u64 {
        self.observations_ignored.load(Ordering::Relaxed)
    }

    pub fn batches_dropped(&self) -> u64 {
        self.batches_dropped.load(Ordering::Relaxed)
    }

    pub fn windows_flushed(&self) -> u64 {
        self.windows_flushed.load(Ordering::Relaxed)
    }

    /// Cumulative count for one category
    pub fn counted(&self, category: Category) -> u64 {
        self.counted_by_category[category.index()].load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let batch_count = self.batches_since_report.swap(0, Ordering::Relaxed);
        let batch_latency_sum = self.batch_latency_sum_us.swap(0, Ordering::Relaxed);
        let batch_latency_max = self.batch_latency_max_us.swap(0, Ordering::Relaxed);
        let batch_lat_buckets = swap_buckets(&self.batch_latency_buckets);

        let flush_lat_buckets = swap_buckets(&self.flush_latency_buckets);
        let flush_latency_sum = self.flush_latency_sum_us.swap(0, Ordering::Relaxed);
        let flush_latency_max = self.flush_latency_max_us.swap(0, Ordering::Relaxed);
        let flush_count: u64 = flush_lat_buckets.iter().sum();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let batches_per_sec = if elapsed.as_secs_f64() > 0.0 {
            batch_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let batch_lat_avg = if batch_count > 0 { batch_latency_sum / batch_count } else { 0 };
        let flush_lat_avg = if flush_count > 0 { flush_latency_sum / flush_count } else { 0 };

        MetricsSummary {
            observations_total: self.observations_total.load(Ordering::Relaxed),
            observations_ignored: self.observations_ignored.load(Ordering::Relaxed),
            batches_total: self.batches_total.load(Ordering::Relaxed),
            batches_per_sec,
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            messages_invalid: self.messages_invalid.load(Ordering::Relaxed),
            batch_lat_buckets,
            batch_lat_sum_us: batch_latency_sum,
            batch_lat_avg_us: batch_lat_avg,
            batch_lat_max_us: batch_latency_max,
            batch_lat_p99_us: percentile_from_buckets(&batch_lat_buckets, 0.99),
            windows_flushed: self.windows_flushed.load(Ordering::Relaxed),
            flush_lat_buckets,
            flush_lat_sum_us: flush_latency_sum,
            flush_lat_avg_us: flush_lat_avg,
            flush_lat_max_us: flush_latency_max,
            flush_lat_p99_us: percentile_from_buckets(&flush_lat_buckets, 0.99),
            counted_by_category: self.load_counted(),
            last_window_total: self.last_window_total.load(Ordering::Relaxed),
            history_len: self.history_len.load(Ordering::Relaxed),
            current_window_ids: self.current_window_ids.load(Ordering::Relaxed),
            egress_failures: self.egress_failures.load(Ordering::Relaxed),
            ingest_queue_depth: self.ingest_queue_depth.load(Ordering::Relaxed),
        }
    }

    /// Read cumulative values without resetting anything
    ///
    /// Histograms, sums, and averages cover the whole process lifetime, so
    /// Prometheus bucket and count series only grow. Max latencies are the
    /// values for the current report period.
    pub fn scrape(&self) -> MetricsSummary {
        let batch_lat_buckets = load_buckets(&self.batch_latency_buckets_total);
        let batch_count: u64 = batch_lat_buckets.iter().sum();
        let batch_latency_sum = self.batch_latency_sum_total_us.load(Ordering::Relaxed);

        let flush_lat_buckets = load_buckets(&self.flush_latency_buckets_total);
        let flush_count: u64 = flush_lat_buckets.iter().sum();
        let flush_latency_sum = self.flush_latency_sum_total_us.load(Ordering::Relaxed);

        let batches_total = self.batches_total.load(Ordering::Relaxed);
        let uptime = self.started_at.elapsed().as_secs_f64();
        let batches_per_sec = if uptime > 0.0 { batches_total as f64 / uptime } else { 0.0 };

        MetricsSummary {
            observations_total: self.observations_total.load(Ordering::Relaxed),
            observations_ignored: self.observations_ignored.load(Ordering::Relaxed),
            batches_total,
            batches_per_sec,
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            messages_invalid: self.messages_invalid.load(Ordering::Relaxed),
            batch_lat_buckets,
            batch_lat_sum_us: batch_latency_sum,
            batch_lat_avg_us: if batch_count > 0 { batch_latency_sum / batch_count } else { 0 },
            batch_lat_max_us: self.batch_latency_max_us.load(Ordering::Relaxed),
            batch_lat_p99_us: percentile_from_buckets(&batch_lat_buckets, 0.99),
            windows_flushed: self.windows_flushed.load(Ordering::Relaxed),
            flush_lat_buckets,
            flush_lat_sum_us: flush_latency_sum,
            flush_lat_avg_us: if flush_count > 0 { flush_latency_sum / flush_count } else { 0 },
            flush_lat_max_us: self.flush_latency_max_us.load(Ordering::Relaxed),
            flush_lat_p99_us: percentile_from_buckets(&flush_lat_buckets, 0.99),
            counted_by_category: self.load_counted(),
            last_window_total: self.last_window_total.load(Ordering::Relaxed),
            history_len: self.history_len.load(Ordering::Relaxed),
            current_window_ids: self.current_window_ids.load(Ordering::Relaxed),
            egress_failures: self.egress_failures.load(Ordering::Relaxed),
            ingest_queue_depth: self.ingest_queue_depth.load(Ordering::Relaxed),
        }
    }

    fn load_counted(&self) -> [u64; NUM_CATEGORIES] {
        std::array::from_fn(|i| self.counted_by_category[i].load(Ordering::Relaxed))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for egress)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub observations_total: u64,
    pub observations_ignored: u64,
    pub batches_total: u64,
    pub batches_per_sec: f64,
    pub batches_dropped: u64,
    pub messages_invalid: u64,
    /// Batch processing latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub batch_lat_buckets: [u64; NUM_BUCKETS],
    pub batch_lat_sum_us: u64,
    pub batch_lat_avg_us: u64,
    pub batch_lat_max_us: u64,
    pub batch_lat_p99_us: u64,
    pub windows_flushed: u64,
    /// Flush latency histogram buckets (same bounds)
    pub flush_lat_buckets: [u64; NUM_BUCKETS],
    pub flush_lat_sum_us: u64,
    pub flush_lat_avg_us: u64,
    pub flush_lat_max_us: u64,
    pub flush_lat_p99_us: u64,
    /// Cumulative counts, indexed by `Category::index`
    pub counted_by_category: [u64; NUM_CATEGORIES],
    pub last_window_total: u64,
    pub history_len: u64,
    pub current_window_ids: u64,
    pub egress_failures: u64,
    pub ingest_queue_depth: u64,
}

impl MetricsSummary {
    pub fn counted(&self, category: Category) -> u64 {
        self.counted_by_category[category.index()]
    }

    pub fn counted_total(&self) -> u64 {
        self.counted_by_category.iter().sum()
    }

    pub fn log(&self) {
        info!(
            observations_total = %self.observations_total,
            observations_ignored = %self.observations_ignored,
            batches_per_sec = format!("{:.1}", self.batches_per_sec),
            batches_dropped = %self.batches_dropped,
            batch_p99_us = %self.batch_lat_p99_us,
            windows_flushed = %self.windows_flushed,
            flush_max_us = %self.flush_lat_max_us,
            counted_total = %self.counted_total(),
            history_len = %self.history_len,
            egress_failures = %self.egress_failures,
            "metrics"
        );
    }
}
