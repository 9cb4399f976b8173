//! Backend health state
//!
//! Each backend carries a small state machine fed by periodic synthetic
//! probes. Consecutive failures take a backend down, consecutive successes
//! bring it back, and the operator can pin the state manually in either
//! direction, overriding whatever the probes say.
//!
//! # State Machine
//!
//! ```text
//!            [max_check_failures consecutive failures]
//!      up ──────────────────────────────────────────────> down
//!      ^                                                    │
//!      └──── [min_rise_successes consecutive successes] ────┘
//!
//!      setUp() / setDown() pin the reported state, setAuto() unpins.
//! ```
//!
//! A backend starts in automatic mode and probed-down; the first healthy
//! probe run brings it up.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use hickory_proto::rr::{Name, RecordType};
use parking_lot::RwLock;
use std::time::Instant;

/// Default probe target.
pub const DEFAULT_CHECK_NAME: &str = "a.root-servers.net.";

/// Default consecutive failures before going down.
pub const DEFAULT_MAX_CHECK_FAILURES: u32 = 1;

/// Default consecutive successes before coming back up.
pub const DEFAULT_MIN_RISE_SUCCESSES: u32 = 1;

/// Default probe interval in seconds.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 1;

/// Default probe timeout in milliseconds.
pub const DEFAULT_CHECK_TIMEOUT_MS: u64 = 1000;

/// Probe configuration for one backend.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Seconds between probe rounds
    pub interval: Duration,
    /// How long to wait for a probe answer
    pub timeout: Duration,
    /// Consecutive failures before the backend goes down
    pub max_check_failures: u32,
    /// Consecutive successes before the backend comes back up
    pub min_rise_successes: u32,
    /// Name the probe asks for
    pub check_name: Name,
    /// Type the probe asks for
    pub check_type: RecordType,
    /// Require a NoError answer; otherwise any non-ServFail answer passes
    pub must_resolve: bool,
    /// Probe only backends that saw traffic since the previous round
    pub lazy: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            timeout: Duration::from_millis(DEFAULT_CHECK_TIMEOUT_MS),
            max_check_failures: DEFAULT_MAX_CHECK_FAILURES,
            min_rise_successes: DEFAULT_MIN_RISE_SUCCESSES,
            check_name: Name::from_str(DEFAULT_CHECK_NAME).expect("static name"),
            check_type: RecordType::A,
            must_resolve: false,
            lazy: false,
        }
    }
}

impl HealthCheckConfig {
    /// Set the probe interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the probe timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the failure threshold.
    #[must_use]
    pub fn with_max_check_failures(mut self, failures: u32) -> Self {
        self.max_check_failures = failures.max(1);
        self
    }

    /// Set the rise threshold.
    #[must_use]
    pub fn with_min_rise_successes(mut self, successes: u32) -> Self {
        self.min_rise_successes = successes.max(1);
        self
    }

    /// Set the probe question.
    #[must_use]
    pub fn with_check_question(mut self, name: Name, qtype: RecordType) -> Self {
        self.check_name = name;
        self.check_type = qtype;
        self
    }
}

/// Operator-facing availability mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Probes decide
    Auto,
    /// Pinned up
    Up,
    /// Pinned down
    Down,
}

const MODE_AUTO: u8 = 0;
const MODE_UP: u8 = 1;
const MODE_DOWN: u8 = 2;

/// A state change produced by a probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The probed state moved from down to up
    Rose,
    /// The probed state moved from up to down
    Fell,
}

/// Probe-driven health state with manual pinning.
#[derive(Debug)]
pub struct HealthState {
    mode: AtomicU8,
    /// What the probes currently say
    probed_up: AtomicBool,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    fell_transitions: AtomicU64,
    rose_transitions: AtomicU64,
    last_transition: RwLock<Option<Instant>>,
    max_check_failures: u32,
    min_rise_successes: u32,
}

impl HealthState {
    /// Create the initial state: automatic mode, probed-down.
    #[must_use]
    pub fn new(config: &HealthCheckConfig) -> Self {
        Self {
            mode: AtomicU8::new(MODE_AUTO),
            probed_up: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            fell_transitions: AtomicU64::new(0),
            rose_transitions: AtomicU64::new(0),
            last_transition: RwLock::new(None),
            max_check_failures: config.max_check_failures.max(1),
            min_rise_successes: config.min_rise_successes.max(1),
        }
    }

    /// The effective availability: a manual pin wins, otherwise the
    /// probed state.
    #[must_use]
    pub fn is_up(&self) -> bool {
        match self.mode.load(Ordering::Acquire) {
            MODE_UP => true,
            MODE_DOWN => false,
            _ => self.probed_up.load(Ordering::Acquire),
        }
    }

    /// The configured mode.
    #[must_use]
    pub fn availability(&self) -> Availability {
        match self.mode.load(Ordering::Acquire) {
            MODE_UP => Availability::Up,
            MODE_DOWN => Availability::Down,
            _ => Availability::Auto,
        }
    }

    /// Pin up.
    pub fn set_up(&self) {
        self.mode.store(MODE_UP, Ordering::Release);
    }

    /// Pin down.
    pub fn set_down(&self) {
        self.mode.store(MODE_DOWN, Ordering::Release);
    }

    /// Let the probes decide again.
    pub fn set_auto(&self) {
        self.mode.store(MODE_AUTO, Ordering::Release);
    }

    /// Status string for the operator surface: pinned states in capitals,
    /// probed states in lowercase.
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self.mode.load(Ordering::Acquire) {
            MODE_UP => "UP",
            MODE_DOWN => "DOWN",
            _ => {
                if self.probed_up.load(Ordering::Acquire) {
                    "up"
                } else {
                    "down"
                }
            }
        }
    }

    /// Feed one probe result; returns the transition it caused, if any.
    pub fn record_probe(&self, success: bool) -> Option<Transition> {
        if success {
            self.consecutive_failures.store(0, Ordering::Release);
            let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if !self.probed_up.load(Ordering::Acquire) && successes >= self.min_rise_successes {
                self.probed_up.store(true, Ordering::Release);
                self.rose_transitions.fetch_add(1, Ordering::Relaxed);
                *self.last_transition.write() = Some(Instant::now());
                return Some(Transition::Rose);
            }
        } else {
            self.consecutive_successes.store(0, Ordering::Release);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if self.probed_up.load(Ordering::Acquire) && failures >= self.max_check_failures {
                self.probed_up.store(false, Ordering::Release);
                self.fell_transitions.fetch_add(1, Ordering::Relaxed);
                *self.last_transition.write() = Some(Instant::now());
                return Some(Transition::Fell);
            }
        }
        None
    }

    /// Consecutive probe failures so far.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Consecutive probe successes so far.
    #[must_use]
    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    /// Down transitions since start.
    #[must_use]
    pub fn fell_transitions(&self) -> u64 {
        self.fell_transitions.load(Ordering::Relaxed)
    }

    /// Up transitions since start.
    #[must_use]
    pub fn rose_transitions(&self) -> u64 {
        self.rose_transitions.load(Ordering::Relaxed)
    }

    /// Time since the probed state last changed.
    #[must_use]
    pub fn time_since_transition(&self) -> Option<Duration> {
        self.last_transition.read().map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(failures: u32, rises: u32) -> HealthState {
        HealthState::new(
            &HealthCheckConfig::default()
                .with_max_check_failures(failures)
                .with_min_rise_successes(rises),
        )
    }

    // ========================================================================
    // Threshold Tests
    // ========================================================================

    #[test]
    fn test_initial_state_is_auto_down() {
        let health = state(1, 1);
        assert_eq!(health.availability(), Availability::Auto);
        assert!(!health.is_up());
        assert_eq!(health.status(), "down");
    }

    #[test]
    fn test_rises_after_min_successes() {
        let health = state(1, 2);
        assert!(health.record_probe(true).is_none());
        assert!(!health.is_up());
        assert_eq!(health.record_probe(true), Some(Transition::Rose));
        assert!(health.is_up());
        assert_eq!(health.status(), "up");
    }

    #[test]
    fn test_falls_after_exactly_max_failures() {
        let health = state(3, 1);
        health.record_probe(true);
        assert!(health.is_up());

        assert!(health.record_probe(false).is_none());
        assert!(health.is_up());
        assert!(health.record_probe(false).is_none());
        assert!(health.is_up());
        // exactly the third consecutive failure takes it down
        assert_eq!(health.record_probe(false), Some(Transition::Fell));
        assert!(!health.is_up());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let health = state(3, 1);
        health.record_probe(true);
        health.record_probe(false);
        health.record_probe(false);
        health.record_probe(true);
        assert_eq!(health.consecutive_failures(), 0);
        health.record_probe(false);
        health.record_probe(false);
        assert!(health.is_up());
    }

    #[test]
    fn test_repeated_failures_fire_one_transition() {
        let health = state(2, 1);
        health.record_probe(true);
        for _ in 0..10 {
            health.record_probe(false);
        }
        assert_eq!(health.fell_transitions(), 1);
    }

    // ========================================================================
    // Pinning Tests
    // ========================================================================

    #[test]
    fn test_pin_overrides_probes() {
        let health = state(1, 1);
        health.set_up();
        assert!(health.is_up());
        assert_eq!(health.status(), "UP");
        // probes keep failing underneath, the pin wins
        health.record_probe(false);
        assert!(health.is_up());

        health.set_down();
        assert!(!health.is_up());
        assert_eq!(health.status(), "DOWN");

        health.set_auto();
        assert_eq!(health.availability(), Availability::Auto);
    }

    #[test]
    fn test_probes_keep_running_under_pin() {
        let health = state(1, 1);
        health.set_down();
        health.record_probe(true);
        health.set_auto();
        // the probe recorded under the pin already brought the probed state up
        assert!(health.is_up());
    }

    // ========================================================================
    // Config Tests
    // ========================================================================

    #[test]
    fn test_config_defaults() {
        let config = HealthCheckConfig::default();
        assert_eq!(config.interval, Duration::from_secs(1));
        assert_eq!(config.timeout, Duration::from_millis(1000));
        assert_eq!(config.max_check_failures, 1);
        assert_eq!(config.min_rise_successes, 1);
        assert_eq!(config.check_name.to_string(), "a.root-servers.net.");
        assert_eq!(config.check_type, RecordType::A);
        assert!(!config.must_resolve);
    }

    #[test]
    fn test_thresholds_clamped_to_one() {
        let config = HealthCheckConfig::default()
            .with_max_check_failures(0)
            .with_min_rise_successes(0);
        assert_eq!(config.max_check_failures, 1);
        assert_eq!(config.min_rise_successes, 1);
    }
}
