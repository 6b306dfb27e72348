//! Windowed, deduplicated per-category counting
//!
//! Accumulates distinct track IDs per category for the current window and
//! emits a snapshot on each flush. A bounded FIFO of past windows suppresses
//! re-counting of IDs seen recently. The tracker recycles IDs, so the history
//! must stay bounded rather than remembering every ID ever seen.
//!
//! Suppression is category-blind: an ID present in any retained window, under
//! any category, is not counted again under any category.

use crate::domain::snapshot::CountSnapshot;
use crate::domain::types::{Category, TrackId};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Default number of past windows retained for deduplication
pub const DEFAULT_RETENTION_WINDOWS: usize = 60;

/// Track IDs seen per category during one window
pub type WindowSet = FxHashMap<Category, FxHashSet<TrackId>>;

/// Deduplicating counter over a rolling window history
#[derive(Debug)]
pub struct WindowedCategoryCounter {
    /// Categories counted, in snapshot processing order
    tracked: Vec<Category>,
    /// IDs observed in the window being accumulated
    current: WindowSet,
    /// Distinct IDs in `current` across all categories
    current_ids: FxHashSet<TrackId>,
    /// Past windows, oldest first; len <= retention
    history: VecDeque<WindowSet>,
    /// Maximum history length
    retention: usize,
    /// Number of flushes performed
    windows_flushed: u64,
}

impl WindowedCategoryCounter {
    /// Create a counter tracking `categories` with `retention` windows of history
    ///
    /// Duplicate categories are ignored; the first occurrence fixes the order.
    pub fn new(categories: &[Category], retention: usize) -> Self {
        let mut tracked = Vec::with_capacity(categories.len());
        for category in categories {
            if !tracked.contains(category) {
                tracked.push(*category);
            }
        }
        Self {
            tracked,
            current: FxHashMap::default(),
            current_ids: FxHashSet::default(),
            // Grows on demand; retention is only an upper bound
            history: VecDeque::new(),
            retention,
            windows_flushed: 0,
        }
    }

    /// Record a tracked entity for the current window
    ///
    /// Untracked categories are dropped silently. Returns whether the
    /// observation was accepted.
    #[inline]
    pub fn observe(&mut self, track_id: TrackId, category: Category) -> bool {
        if !self.tracked.contains(&category) {
            return false;
        }
        self.current.entry(category).or_default().insert(track_id);
        self.current_ids.insert(track_id);
        true
    }

    /// Close the current window and return its deduplicated counts
    ///
    /// `now` is recorded as the snapshot time and is not validated.
    pub fn flush(&mut self, now: u64) -> CountSnapshot {
        let mut already_counted: FxHashSet<TrackId> = FxHashSet::default();
        for window in &self.history {
            for ids in window.values() {
                already_counted.extend(ids.iter().copied());
            }
        }

        let mut counts: BTreeMap<Category, u64> = BTreeMap::new();
        for category in &self.tracked {
            let mut count = 0u64;
            if let Some(ids) = self.current.get(category) {
                for track_id in ids {
                    if already_counted.insert(*track_id) {
                        count += 1;
                    }
                }
            }
            counts.insert(*category, count);
        }

        self.windows_flushed += 1;
        let snapshot = CountSnapshot::new(now, self.windows_flushed, counts);

        let window = std::mem::take(&mut self.current);
        self.current_ids.clear();
        self.history.push_back(window);
        if self.history.len() > self.retention {
            self.history.pop_front();
        }

        debug!(
            window = %self.windows_flushed,
            total = %snapshot.total(),
            suppressed_ids = %already_counted.len(),
            history_len = %self.history.len(),
            "counter_flushed"
        );

        snapshot
    }

    /// Number of past windows currently retained
    #[inline]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Distinct track IDs in the current window across all categories
    #[inline]
    pub fn current_distinct(&self) -> usize {
        self.current_ids.len()
    }

    pub fn tracked_categories(&self) -> &[Category] {
        &self.tracked
    }

    pub fn windows_flushed(&self) -> u64 {
        self.windows_flushed
    }
}

impl Default for WindowedCategoryCounter {
    fn default() -> Self {
        Self::new(&Category::ALL, DEFAULT_RETENTION_WINDOWS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(id: i64) -> TrackId {
        TrackId(id)
    }

    fn counter(retention: usize) -> WindowedCategoryCounter {
        WindowedCategoryCounter::new(&Category::ALL, retention)
    }

    #[test]
    fn test_empty_flush_has_all_categories() {
        let mut counter = counter(60);

        let snapshot = counter.flush(1000);

        assert_eq!(snapshot.ts, 1000);
        assert_eq!(snapshot.window, 1);
        assert_eq!(snapshot.counts.len(), 5);
        for category in Category::ALL {
            assert_eq!(snapshot.counts.get(&category), Some(&0));
        }
    }

    #[test]
    fn test_dedup_within_window() {
        let mut counter = counter(60);

        for _ in 0..10 {
            counter.observe(tid(1), Category::Car);
        }
        counter.observe(tid(2), Category::Car);

        let snapshot = counter.flush(1000);
        assert_eq!(snapshot.count(Category::Car), 2);
    }

    #[test]
    fn test_untracked_category_ignored() {
        let mut counter = WindowedCategoryCounter::new(&[Category::Car, Category::Bus], 60);

        assert!(counter.observe(tid(1), Category::Car));
        assert!(!counter.observe(tid(2), Category::Truck));

        let snapshot = counter.flush(1000);
        assert_eq!(snapshot.counts.len(), 2);
        assert_eq!(snapshot.count(Category::Car), 1);
        assert!(!snapshot.counts.contains_key(&Category::Truck));
    }

    #[test]
    fn test_cross_window_suppression() {
        let retention = 5;
        let mut counter = counter(retention);

        counter.observe(tid(7), Category::Car);
        assert_eq!(counter.flush(0).count(Category::Car), 1);

        for k in 1..retention {
            counter.observe(tid(7), Category::Car);
            let snapshot = counter.flush(k as u64 * 1000);
            assert_eq!(snapshot.count(Category::Car), 0, "window {} recounted", k + 1);
        }
    }

    #[test]
    fn test_re_eligible_after_eviction() {
        let mut counter = counter(2);

        // Window 1: counted
        counter.observe(tid(7), Category::Car);
        assert_eq!(counter.flush(1000).count(Category::Car), 1);

        // Windows 2-3: absent
        counter.flush(2000);
        counter.flush(3000);

        // Window 4: window 1 has aged out
        counter.observe(tid(7), Category::Car);
        assert_eq!(counter.flush(4000).count(Category::Car), 1);
    }

    #[test]
    fn test_still_suppressed_at_retention_boundary() {
        let mut counter = counter(2);

        counter.observe(tid(7), Category::Car);
        counter.flush(1000);
        counter.flush(2000);

        // Window 3: window 1 is still one of the two retained
        counter.observe(tid(7), Category::Car);
        assert_eq!(counter.flush(3000).count(Category::Car), 0);
    }

    #[test]
    fn test_suppression_crosses_categories() {
        let mut counter = counter(60);

        counter.observe(tid(7), Category::Car);
        assert_eq!(counter.flush(1000).count(Category::Car), 1);

        counter.observe(tid(7), Category::Bus);
        let snapshot = counter.flush(2000);
        assert_eq!(snapshot.count(Category::Bus), 0);
        assert_eq!(snapshot.total(), 0);
    }

    #[test]
    fn test_same_id_two_categories_in_one_window_counted_once() {
        let mut counter = counter(60);

        counter.observe(tid(9), Category::Truck);
        counter.observe(tid(9), Category::Car);

        let snapshot = counter.flush(1000);
        assert_eq!(snapshot.total(), 1);
        // Car precedes Truck in processing order
        assert_eq!(snapshot.count(Category::Car), 1);
        assert_eq!(snapshot.count(Category::Truck), 0);
    }

    #[test]
    fn test_configured_order_decides_credit() {
        let mut counter = WindowedCategoryCounter::new(&[Category::Truck, Category::Car], 60);

        counter.observe(tid(9), Category::Car);
        counter.observe(tid(9), Category::Truck);

        let snapshot = counter.flush(1000);
        assert_eq!(snapshot.count(Category::Truck), 1);
        assert_eq!(snapshot.count(Category::Car), 0);
    }

    #[test]
    fn test_history_bound() {
        let retention = 3;
        let mut counter = counter(retention);

        for i in 0..retention {
            assert_eq!(counter.history_len(), i);
            counter.flush(i as u64);
        }
        for i in 0..20 {
            counter.observe(tid(i), Category::Car);
            counter.flush(100 + i as u64);
            assert_eq!(counter.history_len(), retention);
        }
    }

    #[test]
    fn test_suppressed_ids_still_enter_history() {
        // N=2. Window 2 and 3 re-observe id 1, so it never ages out.
        let mut counter = counter(2);

        counter.observe(tid(1), Category::Car);
        counter.observe(tid(2), Category::Car);
        assert_eq!(counter.flush(1000).count(Category::Car), 2);

        counter.observe(tid(1), Category::Car);
        assert_eq!(counter.flush(2000).count(Category::Car), 0);

        counter.observe(tid(1), Category::Car);
        counter.observe(tid(3), Category::Car);
        assert_eq!(counter.flush(3000).count(Category::Car), 1);

        // Windows 2 and 3 are retained and both contain id 1
        counter.observe(tid(1), Category::Car);
        assert_eq!(counter.flush(4000).count(Category::Car), 0);
    }

    #[test]
    fn test_flush_clears_current_window() {
        let mut counter = counter(60);

        counter.observe(tid(1), Category::Car);
        counter.observe(tid(1), Category::Bus);
        counter.observe(tid(2), Category::Bus);
        assert_eq!(counter.current_distinct(), 2);

        counter.flush(1000);
        assert_eq!(counter.current_distinct(), 0);
        assert_eq!(counter.windows_flushed(), 1);
    }

    #[test]
    fn test_zero_retention_keeps_no_history() {
        let mut counter = counter(0);

        counter.observe(tid(1), Category::Car);
        assert_eq!(counter.flush(1000).count(Category::Car), 1);
        assert_eq!(counter.history_len(), 0);

        counter.observe(tid(1), Category::Car);
        assert_eq!(counter.flush(2000).count(Category::Car), 1);
    }

    #[test]
    fn test_current_distinct_tracks_observations() {
        let mut counter = WindowedCategoryCounter::new(&[Category::Car, Category::Bus], 60);

        counter.observe(tid(1), Category::Car);
        counter.observe(tid(1), Category::Car);
        assert_eq!(counter.current_distinct(), 1);

        // Rejected observations do not count
        counter.observe(tid(2), Category::Truck);
        assert_eq!(counter.current_distinct(), 1);

        counter.observe(tid(1), Category::Bus);
        counter.observe(tid(3), Category::Bus);
        assert_eq!(counter.current_distinct(), 2);

        counter.flush(1000);
        counter.observe(tid(3), Category::Car);
        assert_eq!(counter.current_distinct(), 1);
    }

    #[test]
    fn test_unbounded_retention_constructs() {
        let mut counter = counter(usize::MAX);

        counter.observe(tid(1), Category::Car);
        assert_eq!(counter.flush(1000).count(Category::Car), 1);
        counter.observe(tid(1), Category::Car);
        assert_eq!(counter.flush(2000).count(Category::Car), 0);
        assert_eq!(counter.history_len(), 2);
    }

    #[test]
    fn test_duplicate_categories_deduplicated() {
        let counter =
            WindowedCategoryCounter::new(&[Category::Car, Category::Car, Category::Bus], 60);
        assert_eq!(counter.tracked_categories(), &[Category::Car, Category::Bus]);
    }

    #[test]
    fn test_window_sequence_numbers() {
        let mut counter = counter(60);
        assert_eq!(counter.flush(1).window, 1);
        assert_eq!(counter.flush(2).window, 2);
        assert_eq!(counter.flush(3).window, 3);
    }
}
