//! Services - counting logic and state ownership
//!
//! - `counter` - Windowed deduplicating per-category counter
//! - `window_clock` - Stream-time window boundary detection
//! - `aggregator` - Actor that owns the counter and drives flushes

pub mod aggregator;
pub mod counter;
pub mod window_clock;

// Re-export commonly used types
pub use aggregator::CountAggregator;
pub use counter::WindowedCategoryCounter;
pub use window_clock::WindowClock;
