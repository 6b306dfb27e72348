//! Window boundary detection by polling elapsed time
//!
//! Used when windows follow stream time (frame timestamps) instead of a
//! wall-clock interval. A new window starts at the instant the boundary was
//! detected, not at the nominal boundary, so windows are never shorter than
//! `window_ms`.

/// Polls a monotonically advancing millisecond clock for window boundaries
#[derive(Debug, Clone)]
pub struct WindowClock {
    window_ms: u64,
    window_start: Option<u64>,
}

impl WindowClock {
    pub fn new(window_ms: u64) -> Self {
        Self { window_ms, window_start: None }
    }

    /// Returns true when at least `window_ms` has elapsed since the window
    /// started; the next window then starts at `now_ms`.
    ///
    /// The first call only starts the clock. Time going backwards never
    /// triggers a boundary.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        let Some(start) = self.window_start else {
            self.window_start = Some(now_ms);
            return false;
        };

        if now_ms.saturating_sub(start) >= self.window_ms {
            self.window_start = Some(now_ms);
            true
        } else {
            false
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}
