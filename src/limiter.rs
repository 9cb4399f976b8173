//! Token-bucket query rate limiter
//!
//! Both backends and individual rules gate traffic with a token bucket:
//! a steady-state `rate` in queries per second and a `burst` capacity.
//! The bucket starts full, refills continuously from the elapsed time
//! since the last consultation, and admits a query when at least one
//! whole token is available.
//!
//! Two details matter for correctness under real clocks and real probes:
//!
//! - a negative elapsed delta skips the refill but the check proceeds,
//!   so a clock hiccup never poisons the bucket;
//! - a limiter built with `rate == 0` is a passthrough that always admits,
//!   which is how "no limit configured" is represented.
//!
//! # Example
//!
//! ```
//! use dnslb::limiter::QpsLimiter;
//!
//! let limiter = QpsLimiter::new(10, 3);
//! assert!(limiter.check());
//! assert!(limiter.check());
//! assert!(limiter.check());
//! // burst exhausted, nothing refilled yet at this rate
//! assert!(!limiter.check());
//! ```

use std::time::Instant;

use parking_lot::Mutex;

use crate::stopwatch::StopWatch;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    prev: StopWatch,
    last_seen: Option<Instant>,
}

/// Token-bucket limiter with passthrough support.
#[derive(Debug)]
pub struct QpsLimiter {
    rate: u32,
    burst: u32,
    passthrough: bool,
    state: Mutex<BucketState>,
}

impl QpsLimiter {
    /// Create a limiter admitting `rate` queries per second with a bucket
    /// capacity of `burst`. The bucket starts full.
    ///
    /// A `rate` of zero produces a passthrough limiter.
    #[must_use]
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            rate,
            burst,
            passthrough: rate == 0,
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                prev: StopWatch::started(),
                last_seen: None,
            }),
        }
    }

    /// Create a limiter that admits everything.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::new(0, 0)
    }

    /// The configured rate, zero for passthrough limiters.
    #[must_use]
    pub fn rate(&self) -> u32 {
        if self.passthrough {
            0
        } else {
            self.rate
        }
    }

    /// Whether this limiter admits unconditionally.
    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    /// Check whether a query is admitted and consume a token if so.
    pub fn check(&self) -> bool {
        let mut state = self.state.lock();
        state.last_seen = Some(Instant::now());
        if self.passthrough {
            return true;
        }
        if Self::refill_and_test(&mut state, self.rate, self.burst) {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Check whether a query would be admitted without consuming a token.
    pub fn check_only(&self) -> bool {
        let mut state = self.state.lock();
        state.last_seen = Some(Instant::now());
        if self.passthrough {
            return true;
        }
        Self::refill_and_test(&mut state, self.rate, self.burst)
    }

    /// Whether the limiter has been consulted after `cutoff`.
    ///
    /// Used by idle-backend detection: a backend whose limiter has not
    /// been consulted since the last sweep has seen no traffic.
    #[must_use]
    pub fn seen_since(&self, cutoff: Instant) -> bool {
        self.state
            .lock()
            .last_seen
            .is_some_and(|seen| seen > cutoff)
    }

    fn refill_and_test(state: &mut BucketState, rate: u32, burst: u32) -> bool {
        let delta = state.prev.udiff_and_set();
        // Time, frequently, does go backwards. Skip the refill, not the check.
        if delta > 0.0 {
            state.tokens += f64::from(rate) * (delta / 1_000_000.0);
        }
        if state.tokens > f64::from(burst) {
            state.tokens = f64::from(burst);
        }
        // burst = 1 would otherwise never admit with a fractional bucket
        state.tokens >= 1.0
    }
}
