//! Configuration types
//!
//! The whole deployment is described by one JSON document: listeners,
//! backends with their health probes and rate gates, pools with optional
//! caches and policy overrides, the ACL, and the rule chains. Everything
//! carries serde defaults so a minimal config stays minimal, and
//! `Config::validate` rejects bad values before anything binds a socket;
//! an invalid configuration is fatal at load time, never at query time.

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::acl::NetmaskGroup;
use crate::backend::{Backend, BackendConfig, HealthCheckConfig, DEFAULT_MAX_IN_FLIGHT};
use crate::cache::{CacheTuning, MokaPacketCache, DEFAULT_MAX_ENTRY_SIZE};
use crate::error::{Error, Result};
use crate::frontend::TcpFrontendConfig;
use crate::policy::LbPolicy;
use crate::pool::ServerPool;
use crate::rules::{
    Action, ActionKind, HeaderMod, ResponseAction, ResponseRuleAction, RuleAction, RuleMatcher,
};
use crate::runtime::{EngineSettings, Runtime};

/// What to answer when every server of a pool is down but the cache still
/// holds an expired entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleCacheMode {
    /// Answer ServFail
    #[default]
    ServFail,
    /// Serve the expired entry with its TTLs clamped to zero
    ServeStale,
}

/// Listener transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerProtocol {
    /// Plain DNS over UDP
    Udp,
    /// Plain DNS over TCP
    Tcp,
}

/// One listening endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Address to bind
    pub address: SocketAddr,
    /// Transport to terminate
    pub protocol: ListenerProtocol,
    /// Accept queries but never answer
    #[serde(default)]
    pub muted: bool,
    /// Concurrent TCP connection cap
    #[serde(default = "default_max_tcp_connections")]
    pub max_tcp_connections: usize,
    /// Queries served over one TCP connection
    #[serde(default = "default_max_tcp_queries")]
    pub max_tcp_queries_per_conn: usize,
    /// Idle deadline waiting for a TCP query, milliseconds
    #[serde(default = "default_tcp_recv_timeout_ms")]
    pub tcp_recv_timeout_ms: u64,
}

fn default_max_tcp_connections() -> usize {
    crate::frontend::DEFAULT_MAX_TCP_CONNECTIONS
}

fn default_max_tcp_queries() -> usize {
    crate::frontend::DEFAULT_MAX_TCP_QUERIES_PER_CONN
}

fn default_tcp_recv_timeout_ms() -> u64 {
    crate::frontend::DEFAULT_TCP_RECV_TIMEOUT.as_millis() as u64
}

impl ListenerConfig {
    /// TCP tuning derived from this listener.
    #[must_use]
    pub fn tcp_config(&self) -> TcpFrontendConfig {
        TcpFrontendConfig {
            max_connections: self.max_tcp_connections,
            max_queries_per_conn: self.max_tcp_queries_per_conn,
            recv_timeout: Duration::from_millis(self.tcp_recv_timeout_ms),
        }
    }
}

/// Health probe settings for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEntry {
    /// Seconds between probes
    #[serde(default = "default_check_interval_secs")]
    pub interval_secs: u64,
    /// Probe deadline, milliseconds
    #[serde(default = "default_check_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures before going down
    #[serde(default = "default_one")]
    pub max_check_failures: u32,
    /// Consecutive successes before coming back up
    #[serde(default = "default_one")]
    pub min_rise_successes: u32,
    /// Probe question name
    #[serde(default = "default_check_name")]
    pub check_name: String,
    /// Probe question type
    #[serde(default = "default_check_type")]
    pub check_type: String,
    /// Require NoError answers
    #[serde(default)]
    pub must_resolve: bool,
    /// Probe only backends that saw traffic since the previous round
    #[serde(default)]
    pub lazy: bool,
}

fn default_check_interval_secs() -> u64 {
    crate::backend::health::DEFAULT_CHECK_INTERVAL_SECS
}

fn default_check_timeout_ms() -> u64 {
    crate::backend::health::DEFAULT_CHECK_TIMEOUT_MS
}

fn default_one() -> u32 {
    1
}

fn default_check_name() -> String {
    crate::backend::health::DEFAULT_CHECK_NAME.to_string()
}

fn default_check_type() -> String {
    "A".to_string()
}

impl Default for HealthEntry {
    fn default() -> Self {
        serde_json::from_str("{}").expect("all fields defaulted")
    }
}

impl HealthEntry {
    fn to_health_config(&self) -> Result<HealthCheckConfig> {
        let check_name = hickory_proto::rr::Name::from_str(&self.check_name)
            .map_err(|e| Error::config_field(format!("bad check name: {e}"), "check_name"))?;
        let check_type = hickory_proto::rr::RecordType::from_str(&self.check_type)
            .map_err(|e| Error::config_field(format!("bad check type: {e}"), "check_type"))?;
        let mut config = HealthCheckConfig::default()
            .with_interval(Duration::from_secs(self.interval_secs))
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_max_check_failures(self.max_check_failures)
            .with_min_rise_successes(self.min_rise_successes)
            .with_check_question(check_name, check_type);
        config.must_resolve = self.must_resolve;
        config.lazy = self.lazy;
        Ok(config)
    }
}

/// One downstream resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEntry {
    /// Operator-facing name
    pub name: String,
    /// Resolver address
    pub address: SocketAddr,
    /// Bind the fan-out sockets to this local address
    #[serde(default)]
    pub source_address: Option<SocketAddr>,
    /// Bind the fan-out sockets to this interface (Linux)
    #[serde(default)]
    pub source_interface: Option<String>,
    /// Width of the UDP socket fan-out
    #[serde(default = "default_one_usize")]
    pub sockets: usize,
    /// Query rate gate, zero for unlimited
    #[serde(default)]
    pub qps_rate: u32,
    /// Burst capacity of the rate gate
    #[serde(default)]
    pub qps_burst: u32,
    /// Selection weight
    #[serde(default = "default_one")]
    pub weight: u32,
    /// Pool sort order
    #[serde(default = "default_one")]
    pub order: u32,
    /// Pools this backend serves; empty means the default pool
    #[serde(default)]
    pub pools: Vec<String>,
    /// In-flight table capacity
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// How long an unanswered UDP query stays in flight, milliseconds
    #[serde(default = "default_udp_timeout_ms")]
    pub udp_timeout_ms: u64,
    /// Re-open the fan-out when the backend comes back up
    #[serde(default)]
    pub reconnect_on_up: bool,
    /// Health probe settings
    #[serde(default)]
    pub health: HealthEntry,
}

fn default_one_usize() -> usize {
    1
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_udp_timeout_ms() -> u64 {
    crate::backend::DEFAULT_UDP_TIMEOUT.as_millis() as u64
}

impl BackendEntry {
    fn to_backend_config(&self) -> Result<BackendConfig> {
        let mut config = BackendConfig::new(self.name.clone(), self.address)
            .with_qps(self.qps_rate, self.qps_burst)
            .with_weight(self.weight)
            .with_order(self.order)
            .with_socket_count(self.sockets);
        config.source_address = self.source_address;
        config.source_interface = self.source_interface.clone();
        config.max_in_flight = self.max_in_flight;
        config.udp_timeout = Duration::from_millis(self.udp_timeout_ms);
        config.reconnect_on_up = self.reconnect_on_up;
        config.health = self.health.to_health_config()?;
        Ok(config)
    }
}

/// Built-in policy selection by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    FirstAvailable,
    RoundRobin,
    LeastOutstanding,
    Whashed,
    Chashed,
    Random,
}

impl PolicyKind {
    /// The runtime policy this names.
    #[must_use]
    pub fn to_policy(self) -> LbPolicy {
        match self {
            Self::FirstAvailable => LbPolicy::FirstAvailable,
            Self::RoundRobin => LbPolicy::RoundRobin,
            Self::LeastOutstanding => LbPolicy::LeastOutstanding,
            Self::Whashed => LbPolicy::Whashed,
            Self::Chashed => LbPolicy::Chashed,
            Self::Random => LbPolicy::Random,
        }
    }
}

/// Cache settings for one pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntrySettings {
    /// Maximum number of entries
    #[serde(default = "default_cache_entries")]
    pub max_entries: u64,
    /// Responses larger than this are not cached
    #[serde(default = "default_cache_entry_size")]
    pub max_entry_size: usize,
    /// Lower TTL clamp, seconds
    #[serde(default)]
    pub min_ttl_secs: u64,
    /// Upper TTL clamp, seconds
    #[serde(default = "default_cache_max_ttl")]
    pub max_ttl_secs: u64,
    /// How long past expiry an entry stays servable as stale, seconds
    #[serde(default = "default_stale_margin")]
    pub stale_margin_secs: u64,
}

fn default_cache_entries() -> u64 {
    100_000
}

fn default_cache_entry_size() -> usize {
    DEFAULT_MAX_ENTRY_SIZE
}

fn default_cache_max_ttl() -> u64 {
    86_400
}

fn default_stale_margin() -> u64 {
    60
}

impl CacheEntrySettings {
    fn to_tuning(&self) -> CacheTuning {
        CacheTuning {
            max_entries: self.max_entries,
            max_entry_size: self.max_entry_size,
            min_ttl: Duration::from_secs(self.min_ttl_secs),
            max_ttl: Duration::from_secs(self.max_ttl_secs),
            stale_margin: Duration::from_secs(self.stale_margin_secs),
        }
    }
}

/// One pool description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    /// Pool name; the empty string is the default pool
    pub name: String,
    /// Policy override for this pool
    #[serde(default)]
    pub policy: Option<PolicyKind>,
    /// Response cache for this pool
    #[serde(default)]
    pub cache: Option<CacheEntrySettings>,
    /// Forward the client subnet to this pool's backends
    #[serde(default)]
    pub use_ecs: bool,
    /// Cache zero-scope responses without the client subnet
    #[serde(default)]
    pub zero_scope: bool,
}

/// Match predicate of one configured rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchEntry {
    /// Every query
    All,
    /// Question name equals or sits below the suffix
    QnameSuffix {
        /// The suffix
        suffix: String,
    },
    /// Question type equals
    Qtype {
        /// Type mnemonic, e.g. `A` or `AAAA`
        qtype: String,
    },
    /// Client address inside any of the networks
    Source {
        /// CIDR networks
        networks: Vec<String>,
    },
    /// Above a shared query rate
    MaxQps {
        /// Steady-state rate
        rate: u32,
        /// Burst capacity
        burst: u32,
    },
    /// Transport check
    OverTcp {
        /// `true` for stream transports
        tcp: bool,
    },
    /// Every inner predicate
    And {
        /// Inner predicates
        all: Vec<MatchEntry>,
    },
    /// Any inner predicate
    Or {
        /// Inner predicates
        any: Vec<MatchEntry>,
    },
    /// Inverted predicate
    Not {
        /// Inner predicate
        not: Box<MatchEntry>,
    },
}

impl MatchEntry {
    fn to_matcher(&self) -> Result<RuleMatcher> {
        Ok(match self {
            Self::All => RuleMatcher::All,
            Self::QnameSuffix { suffix } => {
                let name = hickory_proto::rr::Name::from_str(suffix)
                    .map_err(|e| Error::config_field(format!("bad suffix: {e}"), "suffix"))?;
                RuleMatcher::QNameSuffix(name.to_lowercase())
            }
            Self::Qtype { qtype } => {
                let qtype = hickory_proto::rr::RecordType::from_str(qtype)
                    .map_err(|e| Error::config_field(format!("bad qtype: {e}"), "qtype"))?;
                RuleMatcher::QTypeIs(qtype)
            }
            Self::Source { networks } => RuleMatcher::SourceIn(NetmaskGroup::from_masks(networks)?),
            Self::MaxQps { rate, burst } => RuleMatcher::MaxQps(Arc::new(
                crate::limiter::QpsLimiter::new(*rate, *burst),
            )),
            Self::OverTcp { tcp } => RuleMatcher::OverTcp(*tcp),
            Self::And { all } => {
                RuleMatcher::And(all.iter().map(Self::to_matcher).collect::<Result<_>>()?)
            }
            Self::Or { any } => {
                RuleMatcher::Or(any.iter().map(Self::to_matcher).collect::<Result<_>>()?)
            }
            Self::Not { not } => RuleMatcher::Not(Box::new(not.to_matcher()?)),
        })
    }
}

/// Action of one configured query rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionEntry {
    Drop,
    Allow,
    Nxdomain,
    Refused,
    Servfail,
    Truncate,
    NoRecurse,
    Noop,
    /// Route to a pool and continue the walk
    Pool {
        /// Target pool name
        pool: String,
    },
    /// Defer the response
    Delay {
        /// Milliseconds
        ms: u32,
    },
    /// Answer with these addresses
    Spoof {
        /// A and/or AAAA data
        addrs: Vec<std::net::IpAddr>,
    },
    /// Clear a header bit and continue
    ClearHeaderBit {
        /// Which bit
        bit: HeaderMod,
    },
}

impl ActionEntry {
    fn to_action(&self) -> Action {
        match self {
            Self::Drop => Action::Drop,
            Self::Allow => Action::Allow,
            Self::Nxdomain => Action::Nxdomain,
            Self::Refused => Action::Refused,
            Self::Servfail => Action::ServFail,
            Self::Truncate => Action::Truncate,
            Self::NoRecurse => Action::NoRecurse,
            Self::Noop => Action::NoOp,
            Self::Pool { pool } => Action::Pool(pool.clone()),
            Self::Delay { ms } => Action::Delay(*ms),
            Self::Spoof { addrs } => Action::Spoof(addrs.clone()),
            Self::ClearHeaderBit { bit } => Action::HeaderModify(*bit),
        }
    }
}

/// One configured query rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEntry {
    /// Operator-facing name
    pub name: String,
    /// Match predicate
    #[serde(rename = "match")]
    pub matcher: MatchEntry,
    /// Effect on match
    pub action: ActionEntry,
}

/// Which response chain a response rule joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseChainKind {
    /// Backend responses
    #[default]
    Response,
    /// Responses served from the cache
    CacheHit,
    /// Engine-synthesized responses
    SelfAnswered,
}

/// Action of one configured response rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseActionEntry {
    Allow,
    Drop,
    Servfail,
    None,
    /// Defer delivery
    Delay {
        /// Milliseconds
        ms: u32,
    },
    /// Clear a header bit and continue
    ClearHeaderBit {
        /// Which bit
        bit: HeaderMod,
    },
}

impl ResponseActionEntry {
    fn to_action(&self) -> ResponseAction {
        match self {
            Self::Allow => ResponseAction::Allow,
            Self::Drop => ResponseAction::Drop,
            Self::Servfail => ResponseAction::ServFail,
            Self::None => ResponseAction::None,
            Self::Delay { ms } => ResponseAction::Delay(*ms),
            Self::ClearHeaderBit { bit } => ResponseAction::HeaderModify(*bit),
        }
    }
}

/// One configured response rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRuleEntry {
    /// Operator-facing name
    pub name: String,
    /// Which chain the rule joins
    #[serde(default)]
    pub chain: ResponseChainKind,
    /// Match predicate
    #[serde(rename = "match")]
    pub matcher: MatchEntry,
    /// Effect on match
    pub action: ResponseActionEntry,
}

/// The whole deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listening endpoints
    pub listeners: Vec<ListenerConfig>,
    /// Downstream resolvers
    pub backends: Vec<BackendEntry>,
    /// Pools beyond the implicit default pool
    #[serde(default)]
    pub pools: Vec<PoolEntry>,
    /// ACL networks; unset keeps the default private ranges
    #[serde(default)]
    pub acl: Option<Vec<String>>,
    /// Global selection policy
    #[serde(default = "default_policy")]
    pub policy: PolicyKind,
    /// Query rules, in order
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
    /// Response rules, in order
    #[serde(default)]
    pub response_rules: Vec<ResponseRuleEntry>,
    /// What a dynamic block does when it carries no override
    #[serde(default = "default_dyn_block_action")]
    pub dyn_block_action: ActionKind,
    /// ServFail instead of dropping when no server is selectable
    #[serde(default)]
    pub serv_fail_on_no_policy: bool,
    /// Stale-cache behavior when every server is down
    #[serde(default)]
    pub stale_cache_mode: StaleCacheMode,
    /// Housekeeping period, seconds
    #[serde(default = "default_maintenance_secs")]
    pub maintenance_interval_secs: u64,
}

fn default_policy() -> PolicyKind {
    PolicyKind::LeastOutstanding
}

fn default_dyn_block_action() -> ActionKind {
    ActionKind::Drop
}

fn default_maintenance_secs() -> u64 {
    60
}

/// Load and validate a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("reading {}: {e}", path.display())))?;
    let config: Config = serde_json::from_str(&raw)
        .map_err(|e| Error::config(format!("parsing {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Reject configurations the engine could not start with.
    pub fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(Error::config_field("no listeners defined", "listeners"));
        }
        if self.backends.is_empty() {
            return Err(Error::config_field("no backends defined", "backends"));
        }
        for backend in &self.backends {
            if backend.max_in_flight == 0 {
                return Err(Error::config_field(
                    format!("backend {} has a zero in-flight capacity", backend.name),
                    "max_in_flight",
                ));
            }
            if backend.qps_rate > 0 && backend.qps_burst == 0 {
                return Err(Error::config_field(
                    format!("backend {} has a rate but no burst", backend.name),
                    "qps_burst",
                ));
            }
            backend.health.to_health_config()?;
        }
        if let Some(acl) = &self.acl {
            NetmaskGroup::from_masks(acl)?;
        }
        for rule in &self.rules {
            rule.matcher.to_matcher()?;
        }
        for rule in &self.response_rules {
            rule.matcher.to_matcher()?;
        }
        Ok(())
    }

    /// Build the runtime tables this configuration describes. Backends are
    /// created disconnected; the caller connects them and spawns the loops.
    pub fn build_runtime(&self) -> Result<(Arc<Runtime>, Vec<Arc<Backend>>)> {
        self.validate()?;

        let settings = EngineSettings {
            dyn_block_action: self.dyn_block_action,
            serv_fail_on_no_policy: self.serv_fail_on_no_policy,
            stale_cache_mode: self.stale_cache_mode,
        };
        let runtime = Runtime::new(settings);

        if let Some(acl) = &self.acl {
            runtime.acl.publish(NetmaskGroup::from_masks(acl)?);
        }
        runtime.policy.publish(self.policy.to_policy());

        for entry in &self.pools {
            let pool = match &entry.cache {
                Some(cache) => Arc::new(ServerPool::with_cache(Arc::new(MokaPacketCache::new(
                    cache.to_tuning(),
                )))),
                None => Arc::new(ServerPool::new()),
            };
            pool.set_policy(entry.policy.map(PolicyKind::to_policy));
            pool.set_use_ecs(entry.use_ecs);
            pool.set_zero_scope(entry.zero_scope);
            runtime.install_pool(&entry.name, pool);
        }

        let mut backends = Vec::with_capacity(self.backends.len());
        for entry in &self.backends {
            let backend = Backend::new(entry.to_backend_config()?);
            runtime.register_server(Arc::clone(&backend), &entry.pools);
            backends.push(backend);
        }

        let query_rules: Vec<_> = self
            .rules
            .iter()
            .map(|rule| {
                Ok(RuleAction::new(
                    rule.name.clone(),
                    rule.matcher.to_matcher()?,
                    rule.action.to_action(),
                ))
            })
            .collect::<Result<_>>()?;
        runtime.query_rules.publish(query_rules);

        let mut response = Vec::new();
        let mut cache_hit = Vec::new();
        let mut self_answered = Vec::new();
        for rule in &self.response_rules {
            let built = ResponseRuleAction::new(
                rule.name.clone(),
                rule.matcher.to_matcher()?,
                rule.action.to_action(),
            );
            match rule.chain {
                ResponseChainKind::Response => response.push(built),
                ResponseChainKind::CacheHit => cache_hit.push(built),
                ResponseChainKind::SelfAnswered => self_answered.push(built),
            }
        }
        runtime.response_rules.publish(response);
        runtime.cache_hit_rules.publish(cache_hit);
        runtime.self_answered_rules.publish(self_answered);

        Ok((runtime, backends))
    }
}
