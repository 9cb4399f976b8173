//! Aggregate engine counters
//!
//! One `EngineStats` instance is shared by every frontend, backend and the
//! engine itself. All counters are relaxed atomics; a consistent-enough
//! `snapshot()` is what external exporters consume. The latency histogram
//! uses the classic fixed bucket boundaries in milliseconds
//! (0-1, 1-10, 10-50, 50-100, 100-1000, slow).

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters for the whole engine.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Well-formed queries accepted from clients
    pub queries: AtomicU64,
    /// Responses delivered to clients
    pub responses: AtomicU64,
    /// ServFail responses delivered (from backends or synthesized)
    pub servfail_responses: AtomicU64,
    /// NoError responses synthesized or relayed by the frontend
    pub frontend_noerror: AtomicU64,
    /// NXDomain responses synthesized or relayed by the frontend
    pub frontend_nxdomain: AtomicU64,
    /// ServFail responses synthesized by the frontend
    pub frontend_servfail: AtomicU64,
    /// Queries that failed header sanity checks
    pub non_compliant_queries: AtomicU64,
    /// Backend responses that failed validation
    pub non_compliant_responses: AtomicU64,
    /// Queries with the RD bit set
    pub rd_queries: AtomicU64,
    /// Packets too short to carry a DNS header
    pub empty_queries: AtomicU64,
    /// Queries denied by the ACL
    pub acl_drops: AtomicU64,
    /// Queries stopped by a dynamic block
    pub dyn_blocked: AtomicU64,
    /// Queries dropped by a rule
    pub rule_drop: AtomicU64,
    /// NXDomain answers produced by a rule
    pub rule_nxdomain: AtomicU64,
    /// Refused answers produced by a rule
    pub rule_refused: AtomicU64,
    /// ServFail answers produced by a rule
    pub rule_servfail: AtomicU64,
    /// Truncated answers produced by a rule
    pub rule_truncated: AtomicU64,
    /// Responses answered by the engine without a backend
    pub self_answered: AtomicU64,
    /// In-flight entries released by the timeout sweep
    pub downstream_timeouts: AtomicU64,
    /// Errors sending a query to a backend
    pub downstream_send_errors: AtomicU64,
    /// Queries for which no policy produced a server
    pub no_policy: AtomicU64,
    /// Packet-cache hits
    pub cache_hits: AtomicU64,
    /// Packet-cache misses
    pub cache_misses: AtomicU64,
    /// TCP connections refused because the dispatch queue was full
    pub tcp_queue_full: AtomicU64,

    // Latency histogram, bucketed on the client-visible round trip.
    pub latency_0_1: AtomicU64,
    pub latency_1_10: AtomicU64,
    pub latency_10_50: AtomicU64,
    pub latency_50_100: AtomicU64,
    pub latency_100_1000: AtomicU64,
    pub latency_slow: AtomicU64,
    /// Sum of all observed latencies in microseconds
    pub latency_sum: AtomicU64,
    /// Number of latency observations
    pub latency_count: AtomicU64,
}

impl EngineStats {
    /// Create a zeroed instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one client-visible round trip, in microseconds.
    pub fn record_latency(&self, usec: u64) {
        let msec = usec / 1_000;
        let bucket = match msec {
            0 => &self.latency_0_1,
            1..=9 => &self.latency_1_10,
            10..=49 => &self.latency_10_50,
            50..=99 => &self.latency_50_100,
            100..=999 => &self.latency_100_1000,
            _ => &self.latency_slow,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
        self.latency_sum.fetch_add(usec, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Average observed latency in microseconds, zero before any sample.
    #[must_use]
    pub fn latency_avg(&self) -> f64 {
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.latency_sum.load(Ordering::Relaxed) as f64 / count as f64
    }

    /// Copy every counter into a plain struct for export.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            queries: load(&self.queries),
            responses: load(&self.responses),
            servfail_responses: load(&self.servfail_responses),
            frontend_noerror: load(&self.frontend_noerror),
            frontend_nxdomain: load(&self.frontend_nxdomain),
            frontend_servfail: load(&self.frontend_servfail),
            non_compliant_queries: load(&self.non_compliant_queries),
            non_compliant_responses: load(&self.non_compliant_responses),
            rd_queries: load(&self.rd_queries),
            empty_queries: load(&self.empty_queries),
            acl_drops: load(&self.acl_drops),
            dyn_blocked: load(&self.dyn_blocked),
            rule_drop: load(&self.rule_drop),
            rule_nxdomain: load(&self.rule_nxdomain),
            rule_refused: load(&self.rule_refused),
            rule_servfail: load(&self.rule_servfail),
            rule_truncated: load(&self.rule_truncated),
            self_answered: load(&self.self_answered),
            downstream_timeouts: load(&self.downstream_timeouts),
            downstream_send_errors: load(&self.downstream_send_errors),
            no_policy: load(&self.no_policy),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            tcp_queue_full: load(&self.tcp_queue_full),
            latency_avg_usec: self.latency_avg(),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StatsSnapshot {
    pub queries: u64,
    pub responses: u64,
    pub servfail_responses: u64,
    pub frontend_noerror: u64,
    pub frontend_nxdomain: u64,
    pub frontend_servfail: u64,
    pub non_compliant_queries: u64,
    pub non_compliant_responses: u64,
    pub rd_queries: u64,
    pub empty_queries: u64,
    pub acl_drops: u64,
    pub dyn_blocked: u64,
    pub rule_drop: u64,
    pub rule_nxdomain: u64,
    pub rule_refused: u64,
    pub rule_servfail: u64,
    pub rule_truncated: u64,
    pub self_answered: u64,
    pub downstream_timeouts: u64,
    pub downstream_send_errors: u64,
    pub no_policy: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub tcp_queue_full: u64,
    pub latency_avg_usec: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_bucketing() {
        let stats = EngineStats::new();
        stats.record_latency(500); // 0 ms bucket
        stats.record_latency(5_000); // 1-10
        stats.record_latency(20_000); // 10-50
        stats.record_latency(75_000); // 50-100
        stats.record_latency(500_000); // 100-1000
        stats.record_latency(2_000_000); // slow

        assert_eq!(stats.latency_0_1.load(Ordering::Relaxed), 1);
        assert_eq!(stats.latency_1_10.load(Ordering::Relaxed), 1);
        assert_eq!(stats.latency_10_50.load(Ordering::Relaxed), 1);
        assert_eq!(stats.latency_50_100.load(Ordering::Relaxed), 1);
        assert_eq!(stats.latency_100_1000.load(Ordering::Relaxed), 1);
        assert_eq!(stats.latency_slow.load(Ordering::Relaxed), 1);
        assert_eq!(stats.latency_count.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn test_latency_avg() {
        let stats = EngineStats::new();
        assert_eq!(stats.latency_avg(), 0.0);
        stats.record_latency(1_000);
        stats.record_latency(3_000);
        assert!((stats.latency_avg() - 2_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_copies_counters() {
        let stats = EngineStats::new();
        stats.queries.fetch_add(7, Ordering::Relaxed);
        stats.acl_drops.fetch_add(2, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.queries, 7);
        assert_eq!(snap.acl_drops, 2);
        // later increments do not change the snapshot
        stats.queries.fetch_add(1, Ordering::Relaxed);
        assert_eq!(snap.queries, 7);
    }
}
