//! Shared runtime state
//!
//! Everything an operator can edit while the engine runs lives here, each
//! table behind its own snapshot holder: the ACL, the global policy, the
//! backend list, the pools, the four rule chains and the two dynamic block
//! tables. The query path takes one snapshot per table per query and never
//! blocks on an editor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tracing::{debug, info};

use crate::acl::NetmaskGroup;
use crate::backend::Backend;
use crate::config::StaleCacheMode;
use crate::dynblock::{AddressBlockTable, SuffixBlockTable};
use crate::holder::Holder;
use crate::metrics::EngineStats;
use crate::policy::LbPolicy;
use crate::pool::{ServerPool, DEFAULT_POOL};
use crate::rules::{ActionKind, ResponseRuleChain, RuleChain};

/// Engine-wide behavior knobs, fixed at start.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// What a non-warning dynamic block does when it carries no override
    pub dyn_block_action: ActionKind,
    /// Answer ServFail instead of dropping when no policy picks a server
    pub serv_fail_on_no_policy: bool,
    /// What to do when every server of a pool is down but the cache still
    /// holds an expired entry
    pub stale_cache_mode: StaleCacheMode,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dyn_block_action: ActionKind::Drop,
            serv_fail_on_no_policy: false,
            stale_cache_mode: StaleCacheMode::ServFail,
        }
    }
}

/// The bundle of live-editable tables.
#[derive(Debug)]
pub struct Runtime {
    /// Client allow-list
    pub acl: Holder<NetmaskGroup>,
    /// Global selection policy
    pub policy: Holder<LbPolicy>,
    /// Every registered backend, pools aside
    pub servers: Holder<Vec<Arc<Backend>>>,
    /// Pools by name; `""` is the default pool
    pub pools: Holder<HashMap<String, Arc<ServerPool>>>,
    /// Query rule chain
    pub query_rules: Holder<RuleChain>,
    /// Response rule chain
    pub response_rules: Holder<ResponseRuleChain>,
    /// Response rules applied to cache hits only
    pub cache_hit_rules: Holder<ResponseRuleChain>,
    /// Response rules applied to engine-synthesized answers
    pub self_answered_rules: Holder<ResponseRuleChain>,
    /// Dynamic blocks keyed by client network
    pub dyn_block_addresses: Holder<AddressBlockTable>,
    /// Dynamic blocks keyed by name suffix
    pub dyn_block_suffixes: Holder<SuffixBlockTable>,
    /// Fixed behavior knobs
    pub settings: EngineSettings,
}

impl Runtime {
    /// A runtime with the default ACL, the default policy and an empty
    /// default pool.
    #[must_use]
    pub fn new(settings: EngineSettings) -> Arc<Self> {
        let mut pools = HashMap::new();
        pools.insert(DEFAULT_POOL.to_string(), Arc::new(ServerPool::new()));
        Arc::new(Self {
            acl: Holder::new(NetmaskGroup::default_acl()),
            policy: Holder::new(LbPolicy::default()),
            servers: Holder::new(Vec::new()),
            pools: Holder::new(pools),
            query_rules: Holder::new(Vec::new()),
            response_rules: Holder::new(Vec::new()),
            cache_hit_rules: Holder::new(Vec::new()),
            self_answered_rules: Holder::new(Vec::new()),
            dyn_block_addresses: Holder::new(AddressBlockTable::new()),
            dyn_block_suffixes: Holder::new(SuffixBlockTable::new()),
            settings,
        })
    }

    /// Look up a pool by name.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<Arc<ServerPool>> {
        self.pools.load().get(name).map(Arc::clone)
    }

    /// Look up a pool by name, creating an empty one when missing.
    pub fn get_or_create_pool(&self, name: &str) -> Arc<ServerPool> {
        if let Some(pool) = self.pool(name) {
            return pool;
        }
        self.pools.modify(|pools| {
            Arc::clone(
                pools
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(ServerPool::new())),
            )
        })
    }

    /// Replace a pool wholesale, for attaching a cache at build time.
    pub fn install_pool(&self, name: &str, pool: Arc<ServerPool>) {
        self.pools.modify(|pools| {
            pools.insert(name.to_string(), pool);
        });
    }

    /// Register a backend and attach it to the named pools. Backends with
    /// no pool names land in the default pool.
    pub fn register_server(&self, server: Arc<Backend>, pool_names: &[String]) {
        self.servers.modify(|servers| servers.push(Arc::clone(&server)));
        if pool_names.is_empty() {
            self.get_or_create_pool(DEFAULT_POOL)
                .add_server(Arc::clone(&server));
            server.add_pool(DEFAULT_POOL);
        } else {
            for name in pool_names {
                self.get_or_create_pool(name).add_server(Arc::clone(&server));
                server.add_pool(name);
            }
        }
        info!(backend = %server.name_with_addr(), pools = ?server.pools(), "backend registered");
    }

    /// Remove a backend everywhere and stop it.
    pub fn unregister_server(&self, server: &Arc<Backend>) {
        self.servers
            .modify(|servers| servers.retain(|s| s.id != server.id));
        for name in server.pools() {
            if let Some(pool) = self.pool(&name) {
                pool.remove_server(server.id);
            }
        }
        server.stop();
    }

    /// Change a backend's weight: the ring re-hashes and every pool that
    /// carries the backend re-sorts its snapshot.
    pub fn set_server_weight(&self, server: &Arc<Backend>, weight: u32) {
        server.set_weight(weight);
        for name in server.pools() {
            if let Some(pool) = self.pool(&name) {
                pool.resort();
            }
        }
    }

    /// One housekeeping pass: drop expired dynamic blocks and expunge the
    /// pool caches.
    pub fn maintenance(&self, now: Instant) {
        let removed_addrs = self
            .dyn_block_addresses
            .modify(|table| table.purge_expired(now));
        let removed_suffixes = self
            .dyn_block_suffixes
            .modify(|table| table.purge_expired(now));
        if removed_addrs + removed_suffixes > 0 {
            debug!(
                addresses = removed_addrs,
                suffixes = removed_suffixes,
                "purged expired dynamic blocks"
            );
        }
        for pool in self.pools.load().values() {
            if let Some(cache) = pool.cache() {
                cache.expunge_expired(now);
            }
        }
    }
}

/// Periodic housekeeping: dynamic-block expiry and cache cleaning.
pub async fn run_maintenance(runtime: Arc<Runtime>, period: Duration) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        runtime.maintenance(Instant::now());
    }
}

/// The health-check loop: every second, sweep each backend's in-flight
/// table for timeouts and probe the backends whose interval elapsed.
pub async fn run_health_checks(runtime: Arc<Runtime>, stats: Arc<EngineStats>) {
    let mut ticker = interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let round_started = Instant::now();
        let servers = runtime.servers.snapshot();
        for server in servers.iter() {
            if server.is_stopped() {
                continue;
            }
            let timeouts = server.health_check_round(round_started).await;
            if timeouts > 0 {
                stats
                    .downstream_timeouts
                    .fetch_add(timeouts as u64, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendConfig;

    fn server(name: &str) -> Arc<Backend> {
        Backend::new(BackendConfig::new(
            name,
            "127.0.0.1:5300".parse().unwrap(),
        ))
    }

    #[test]
    fn test_new_runtime_has_default_pool_and_acl() {
        let runtime = Runtime::new(EngineSettings::default());
        assert!(runtime.pool(DEFAULT_POOL).is_some());
        assert!(runtime.pool("nope").is_none());
        assert!(!runtime.acl.load().is_empty());
    }

    #[test]
    fn test_register_server_defaults_to_default_pool() {
        let runtime = Runtime::new(EngineSettings::default());
        let backend = server("b1");
        runtime.register_server(Arc::clone(&backend), &[]);

        assert_eq!(runtime.servers.load().len(), 1);
        let pool = runtime.pool(DEFAULT_POOL).unwrap();
        assert_eq!(pool.count_servers(false), 1);
        assert_eq!(backend.pools(), vec![DEFAULT_POOL.to_string()]);
    }

    #[test]
    fn test_register_server_creates_named_pools() {
        let runtime = Runtime::new(EngineSettings::default());
        let backend = server("b1");
        runtime.register_server(Arc::clone(&backend), &["abuse".to_string()]);
        assert!(runtime.pool("abuse").is_some());
        assert_eq!(runtime.pool("abuse").unwrap().count_servers(false), 1);
        // not in the default pool
        assert_eq!(runtime.pool(DEFAULT_POOL).unwrap().count_servers(false), 0);
    }

    #[test]
    fn test_unregister_server_removes_everywhere() {
        let runtime = Runtime::new(EngineSettings::default());
        let backend = server("b1");
        runtime.register_server(Arc::clone(&backend), &["a".to_string(), "b".to_string()]);
        runtime.unregister_server(&backend);

        assert!(runtime.servers.load().is_empty());
        assert_eq!(runtime.pool("a").unwrap().count_servers(false), 0);
        assert_eq!(runtime.pool("b").unwrap().count_servers(false), 0);
        assert!(backend.is_stopped());
    }

    #[test]
    fn test_maintenance_purges_dyn_blocks() {
        use crate::dynblock::DynBlock;

        let runtime = Runtime::new(EngineSettings::default());
        runtime.dyn_block_suffixes.modify(|table| {
            table.insert(
                "evil.test",
                DynBlock::new("gone", Instant::now() - Duration::from_secs(1)),
            );
        });
        assert_eq!(runtime.dyn_block_suffixes.load().len(), 1);
        runtime.maintenance(Instant::now());
        assert_eq!(runtime.dyn_block_suffixes.load().len(), 0);
    }

    #[test]
    fn test_get_or_create_pool_is_idempotent() {
        let runtime = Runtime::new(EngineSettings::default());
        let a = runtime.get_or_create_pool("x");
        let b = runtime.get_or_create_pool("x");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
