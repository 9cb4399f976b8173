//! Monotonic stopwatch with microsecond resolution
//!
//! Latency accounting and the token-bucket limiter both need cheap
//! monotonic deltas. `StopWatch` wraps `Instant` and reports elapsed time
//! in microseconds as `f64`, matching the resolution the latency buckets
//! and the limiter operate on.

use std::time::Instant;

/// A restartable monotonic stopwatch.
///
/// # Example
///
/// ```
/// use dnslb::stopwatch::StopWatch;
///
/// let mut sw = StopWatch::started();
/// let elapsed = sw.udiff();
/// assert!(elapsed >= 0.0);
/// let since_reset = sw.udiff_and_set();
/// assert!(since_reset >= elapsed);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct StopWatch {
    start: Instant,
}

impl StopWatch {
    /// Create a stopwatch anchored at the current instant.
    #[must_use]
    pub fn started() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Re-anchor at the current instant.
    pub fn start(&mut self) {
        self.start = Instant::now();
    }

    /// Anchor at a specific instant.
    pub fn set(&mut self, from: Instant) {
        self.start = from;
    }

    /// The anchor instant.
    #[must_use]
    pub fn anchor(&self) -> Instant {
        self.start
    }

    /// Microseconds elapsed since the anchor.
    #[must_use]
    pub fn udiff(&self) -> f64 {
        let elapsed = self.start.elapsed();
        elapsed.as_secs() as f64 * 1_000_000.0 + f64::from(elapsed.subsec_nanos()) / 1_000.0
    }

    /// Microseconds elapsed since the anchor, then re-anchor at now.
    pub fn udiff_and_set(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.start);
        self.start = now;
        elapsed.as_secs() as f64 * 1_000_000.0 + f64::from(elapsed.subsec_nanos()) / 1_000.0
    }
}

impl Default for StopWatch {
    fn default() -> Self {
        Self::started()
    }
}
