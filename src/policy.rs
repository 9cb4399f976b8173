//! Server selection policies
//!
//! A policy is a pure function from a pool snapshot and a query to at most
//! one backend. Only up servers are considered; what "up" means is the
//! backend's health state, manual pins included.
//!
//! The hashed policies key on the query name with a deterministic hasher,
//! so a given name maps to the same backend across restarts as long as the
//! backend set and weights are unchanged.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hickory_proto::rr::Name;
use rand::Rng;

use crate::backend::Backend;
use crate::pool::NumberedServer;
use crate::question::QueryContext;

/// Custom selection logic supplied by the embedding application.
pub trait PolicySelector: Send + Sync + fmt::Debug {
    /// Policy name for the operator surface.
    fn name(&self) -> &str;

    /// Pick a backend from a pool snapshot, or none.
    fn select(&self, servers: &[NumberedServer], ctx: &QueryContext) -> Option<Arc<Backend>>;
}

/// The built-in policies plus the custom escape hatch.
#[derive(Debug, Clone)]
pub enum LbPolicy {
    /// First up server, in pool order, whose limiter admits the query
    FirstAvailable,
    /// Cycle through the up servers
    RoundRobin,
    /// Minimum of (outstanding, order, smoothed latency)
    LeastOutstanding,
    /// Weighted hash of the query name
    Whashed,
    /// Consistent-hash ring lookup of the query name
    Chashed,
    /// Uniformly random up server
    Random,
    /// User-supplied selector
    Custom(Arc<dyn PolicySelector>),
}

impl Default for LbPolicy {
    fn default() -> Self {
        Self::LeastOutstanding
    }
}

// One process-wide cursor, like the counter a round-robin policy function
// would keep as local state.
static ROUND_ROBIN_CURSOR: AtomicUsize = AtomicUsize::new(0);

/// Deterministic hash of a query name, shared by the hashed policies.
#[must_use]
pub fn qname_hash(name: &Name) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.to_string().to_lowercase().hash(&mut hasher);
    hasher.finish()
}

impl LbPolicy {
    /// Policy name for the operator surface.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::FirstAvailable => "firstAvailable",
            Self::RoundRobin => "roundrobin",
            Self::LeastOutstanding => "leastOutstanding",
            Self::Whashed => "whashed",
            Self::Chashed => "chashed",
            Self::Random => "random",
            Self::Custom(custom) => custom.name(),
        }
    }

    /// Pick a backend for `ctx` from a pool snapshot.
    #[must_use]
    pub fn select(&self, servers: &[NumberedServer], ctx: &QueryContext) -> Option<Arc<Backend>> {
        if let Self::Custom(custom) = self {
            return custom.select(servers, ctx);
        }
        if let Self::FirstAvailable = self {
            // admission is part of the predicate here, checked without
            // consuming; the send path takes the token
            return servers
                .iter()
                .find(|entry| entry.server.is_up() && entry.server.limiter.check_only())
                .map(|entry| Arc::clone(&entry.server));
        }

        let up: Vec<&NumberedServer> = servers.iter().filter(|e| e.server.is_up()).collect();
        if up.is_empty() {
            return None;
        }

        let picked = match self {
            Self::RoundRobin => {
                let cursor = ROUND_ROBIN_CURSOR.fetch_add(1, Ordering::Relaxed);
                up[cursor % up.len()]
            }
            Self::LeastOutstanding => up
                .iter()
                .min_by_key(|e| {
                    (
                        e.server.outstanding(),
                        u64::from(e.server.order()),
                        e.server.latency_usec() as u64,
                    )
                })
                .copied()?,
            Self::Whashed => Self::select_whashed(&up, ctx)?,
            Self::Chashed => Self::select_chashed(&up, ctx)?,
            Self::Random => up[rand::thread_rng().gen_range(0..up.len())],
            Self::FirstAvailable | Self::Custom(_) => unreachable!("handled above"),
        };
        Some(Arc::clone(&picked.server))
    }

    fn select_whashed<'a>(
        up: &[&'a NumberedServer],
        ctx: &QueryContext,
    ) -> Option<&'a NumberedServer> {
        let total: u64 = up.iter().map(|e| u64::from(e.server.weight())).sum();
        if total == 0 {
            return None;
        }
        let mut remaining = qname_hash(&ctx.qname) % total;
        for &entry in up {
            let weight = u64::from(entry.server.weight());
            if remaining < weight {
                return Some(entry);
            }
            remaining -= weight;
        }
        up.first().copied()
    }

    fn select_chashed<'a>(
        up: &[&'a NumberedServer],
        ctx: &QueryContext,
    ) -> Option<&'a NumberedServer> {
        let needle = qname_hash(&ctx.qname);
        // first ring position at or after the needle; wrap to the globally
        // smallest position when nothing is
        let mut ahead: Option<(u64, &NumberedServer)> = None;
        let mut wrap: Option<(u64, &NumberedServer)> = None;
        for &entry in up {
            let hashes = entry.server.ring_hashes();
            if let Some(&first) = hashes.first() {
                match wrap {
                    Some((best, _)) if first >= best => {}
                    _ => wrap = Some((first, entry)),
                }
            }
            // the per-server lists are sorted, binary search gives the
            // first position >= needle
            let idx = hashes.partition_point(|&h| h < needle);
            if let Some(&candidate) = hashes.get(idx) {
                match ahead {
                    Some((best, _)) if candidate >= best => {}
                    _ => ahead = Some((candidate, entry)),
                }
            }
        }
        ahead.or(wrap).map(|(_, entry)| entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendConfig;
    use crate::question::test_support::query_context;
    use hickory_proto::rr::RecordType;

    fn up_server(name: &str, port: u16, weight: u32, order: u32) -> NumberedServer {
        let config = BackendConfig::new(name, format!("127.0.0.1:{port}").parse().unwrap())
            .with_weight(weight)
            .with_order(order);
        let server = crate::backend::Backend::new(config);
        server.health.set_up();
        NumberedServer {
            position: order,
            server,
        }
    }

    fn ctx_for(qname: &str) -> QueryContext {
        query_context(qname, RecordType::A, "10.0.0.1:4242")
    }

    // ========================================================================
    // Round-Robin Tests
    // ========================================================================

    #[test]
    fn test_round_robin_alternates() {
        let servers = vec![up_server("b1", 5301, 1, 1), up_server("b2", 5302, 1, 2)];
        let ctx = ctx_for("example.com.");
        let policy = LbPolicy::RoundRobin;

        let picks: Vec<_> = (0..4)
            .map(|_| policy.select(&servers, &ctx).unwrap().name().to_string())
            .collect();
        assert_ne!(picks[0], picks[1]);
        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
    }

    #[test]
    fn test_round_robin_skips_down_servers() {
        let servers = vec![up_server("b1", 5301, 1, 1), up_server("b2", 5302, 1, 2)];
        servers[0].server.health.set_down();
        let ctx = ctx_for("example.com.");
        for _ in 0..4 {
            let picked = LbPolicy::RoundRobin.select(&servers, &ctx).unwrap();
            assert_eq!(picked.name(), "b2");
        }
    }

    #[test]
    fn test_no_up_servers_selects_nothing() {
        let servers = vec![up_server("b1", 5301, 1, 1)];
        servers[0].server.health.set_down();
        let ctx = ctx_for("example.com.");
        for policy in [
            LbPolicy::FirstAvailable,
            LbPolicy::RoundRobin,
            LbPolicy::LeastOutstanding,
            LbPolicy::Whashed,
            LbPolicy::Chashed,
            LbPolicy::Random,
        ] {
            assert!(policy.select(&servers, &ctx).is_none(), "{}", policy.name());
        }
    }

    // ========================================================================
    // First-Available Tests
    // ========================================================================

    #[test]
    fn test_first_available_respects_order_and_limiter() {
        let first = up_server("b1", 5301, 1, 1);
        let second = up_server("b2", 5302, 1, 2);
        let ctx = ctx_for("example.com.");
        let policy = LbPolicy::FirstAvailable;

        let servers = vec![first, second];
        let picked = policy.select(&servers, &ctx).unwrap();
        assert_eq!(picked.name(), "b1");

        // a rate-limited first server falls through to the second
        let limited = {
            let config = BackendConfig::new("b1", "127.0.0.1:5301".parse().unwrap())
                .with_qps(1, 1)
                .with_order(1);
            let server = crate::backend::Backend::new(config);
            server.health.set_up();
            NumberedServer {
                position: 1,
                server,
            }
        };
        // exhaust the single token
        assert!(limited.server.limiter.check());
        let servers = vec![limited, up_server("b2", 5302, 1, 2)];
        let picked = policy.select(&servers, &ctx).unwrap();
        assert_eq!(picked.name(), "b2");
    }

    // ========================================================================
    // Least-Outstanding Tests
    // ========================================================================

    #[test]
    fn test_least_outstanding_breaks_ties_by_order() {
        let servers = vec![up_server("b2", 5302, 1, 2), up_server("b1", 5301, 1, 1)];
        let ctx = ctx_for("example.com.");
        let picked = LbPolicy::LeastOutstanding.select(&servers, &ctx).unwrap();
        assert_eq!(picked.name(), "b1");
    }

    // ========================================================================
    // Hashed Policy Tests
    // ========================================================================

    #[test]
    fn test_whashed_is_deterministic() {
        let servers = vec![
            up_server("b1", 5301, 3, 1),
            up_server("b2", 5302, 1, 2),
            up_server("b3", 5303, 2, 3),
        ];
        let ctx = ctx_for("stable.example.com.");
        let first = LbPolicy::Whashed.select(&servers, &ctx).unwrap();
        for _ in 0..16 {
            let again = LbPolicy::Whashed.select(&servers, &ctx).unwrap();
            assert_eq!(first.name(), again.name());
        }
    }

    #[test]
    fn test_whashed_spreads_names() {
        let servers = vec![up_server("b1", 5301, 1, 1), up_server("b2", 5302, 1, 2)];
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            let ctx = ctx_for(&format!("host{i}.example.com."));
            let picked = LbPolicy::Whashed.select(&servers, &ctx).unwrap();
            seen.insert(picked.name().to_string());
        }
        assert_eq!(seen.len(), 2, "64 names should land on both servers");
    }

    #[test]
    fn test_chashed_is_deterministic_and_spreads() {
        let servers = vec![
            up_server("b1", 5301, 8, 1),
            up_server("b2", 5302, 8, 2),
            up_server("b3", 5303, 8, 3),
        ];
        let mut seen = std::collections::HashSet::new();
        for i in 0..96 {
            let ctx = ctx_for(&format!("host{i}.example.com."));
            let first = LbPolicy::Chashed.select(&servers, &ctx).unwrap();
            let again = LbPolicy::Chashed.select(&servers, &ctx).unwrap();
            assert_eq!(first.name(), again.name());
            seen.insert(first.name().to_string());
        }
        assert!(seen.len() >= 2, "96 names should spread over the ring");
    }

    #[test]
    fn test_chashed_moves_names_off_down_server() {
        let servers = vec![
            up_server("b1", 5301, 8, 1),
            up_server("b2", 5302, 8, 2),
        ];
        let ctx = ctx_for("sticky.example.com.");
        let original = LbPolicy::Chashed.select(&servers, &ctx).unwrap();
        original.health.set_down();
        let moved = LbPolicy::Chashed.select(&servers, &ctx).unwrap();
        assert_ne!(original.name(), moved.name());
    }

    // ========================================================================
    // Custom Policy Tests
    // ========================================================================

    #[derive(Debug)]
    struct AlwaysLast;

    impl PolicySelector for AlwaysLast {
        fn name(&self) -> &str {
            "alwaysLast"
        }

        fn select(&self, servers: &[NumberedServer], _ctx: &QueryContext) -> Option<Arc<Backend>> {
            servers
                .iter()
                .rev()
                .find(|e| e.server.is_up())
                .map(|e| Arc::clone(&e.server))
        }
    }

    #[test]
    fn test_custom_policy() {
        let servers = vec![up_server("b1", 5301, 1, 1), up_server("b2", 5302, 1, 2)];
        let ctx = ctx_for("example.com.");
        let policy = LbPolicy::Custom(Arc::new(AlwaysLast));
        assert_eq!(policy.name(), "alwaysLast");
        assert_eq!(policy.select(&servers, &ctx).unwrap().name(), "b2");
    }

    #[test]
    fn test_qname_hash_case_insensitive() {
        use std::str::FromStr;
        let a = qname_hash(&Name::from_str("Example.COM.").unwrap());
        let b = qname_hash(&Name::from_str("example.com.").unwrap());
        assert_eq!(a, b);
    }
}
