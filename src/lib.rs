//! dnslb: high-performance DNS load balancer and policy engine
//!
//! dnslb sits between stub or recursive DNS clients and a pool of backend
//! resolvers. Every query runs through an ordered rule chain that can
//! drop, synthesize, rate-limit, rewrite or re-route it, then a selection
//! policy picks a healthy backend, the in-flight table records how to
//! answer the original client, and the response runs back through its own
//! rule chain and optionally into the pool cache.
//!
//! # Features
//!
//! - **Policies**: first-available, round-robin, least-outstanding,
//!   weighted hash, consistent hash, random, or a custom selector
//! - **Health checks**: synthetic probes with hysteresis and manual pinning
//! - **Rate limiting**: token buckets per backend and per rule
//! - **Dynamic blocks**: temporary bans by client network or name suffix
//! - **Caching**: per-pool response cache with stale-serve support
//! - **Live editing**: every operator-editable table publishes immutable
//!   snapshots, the query path never takes a lock on them
//!
//! # Architecture
//!
//! ```text
//! Client Query
//!     │
//!     ▼
//! ┌─────────────────┐
//! │    Frontend     │  UDP / TCP listener
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │  Query Engine   │  sanity → ACL → dyn blocks → rules → cache
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │     Policy      │ ─── none ──▶ ServFail / Drop
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │    Backend      │  slot claim → id rewrite → socket fan-out
//! └────────┬────────┘
//!          ▼
//!   Responder loop ──▶ correlate → response rules → cache → client
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dnslb::backend::{Backend, BackendConfig};
//! use dnslb::engine::QueryEngine;
//! use dnslb::metrics::EngineStats;
//! use dnslb::runtime::{EngineSettings, Runtime};
//!
//! let runtime = Runtime::new(EngineSettings::default());
//! let backend = Backend::new(BackendConfig::new("resolver", "192.0.2.1:53".parse().unwrap()));
//! runtime.register_server(backend, &[]);
//! let engine = QueryEngine::new(runtime, Arc::new(EngineStats::new()));
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

pub mod acl;
pub mod backend;
pub mod cache;
pub mod config;
pub mod dynblock;
pub mod engine;
pub mod error;
pub mod frontend;
pub mod holder;
pub mod limiter;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod question;
pub mod rules;
pub mod runtime;
pub mod stopwatch;

// Re-export the types most embeddings touch.
pub use acl::NetmaskGroup;
pub use backend::{Backend, BackendConfig, HealthCheckConfig, SlotPayload, SlotTable};
pub use cache::{CacheKey, CacheTuning, MokaPacketCache, PacketCache};
pub use config::{load_config, Config, StaleCacheMode};
pub use dynblock::{AddressBlockTable, DynBlock, SuffixBlockTable};
pub use engine::{ProcessOutcome, QueryEngine};
pub use error::{Error, Result};
pub use frontend::{Frontend, FrontendKind, TcpFrontend, UdpFrontend};
pub use holder::Holder;
pub use limiter::QpsLimiter;
pub use metrics::{EngineStats, StatsSnapshot};
pub use policy::{LbPolicy, PolicySelector};
pub use pool::{NumberedServer, ServerPool, DEFAULT_POOL};
pub use question::QueryContext;
pub use rules::{Action, ResponseAction, ResponseRuleAction, RuleAction, RuleMatcher};
pub use runtime::{EngineSettings, Runtime};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_module_exports() {
        let _acl = NetmaskGroup::default_acl();
        let _limiter = QpsLimiter::passthrough();
        let _stats = EngineStats::new();
        let _settings = EngineSettings::default();
        let _pool = ServerPool::new();
        let _table = SlotTable::new(16);
    }
}
