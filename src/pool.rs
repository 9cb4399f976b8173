//! Server pools
//!
//! A pool is a named, ordered, numbered set of backends, optionally with
//! its own cache and policy override. The server vector is immutable once
//! published: edits clone it, mutate the clone, stable-sort by the backend
//! order, renumber the positions densely from one and publish the result.
//! Readers snapshot the vector once per query and never lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::backend::Backend;
use crate::cache::PacketCache;
use crate::policy::LbPolicy;

/// Name of the pool queries land in when no rule routed them elsewhere.
pub const DEFAULT_POOL: &str = "";

/// One pool slot: a dense 1-based position and the backend itself.
#[derive(Debug, Clone)]
pub struct NumberedServer {
    /// Dense position, renumbered on every edit
    pub position: u32,
    /// The backend
    pub server: Arc<Backend>,
}

/// A named set of backends with optional cache and policy override.
#[derive(Debug)]
pub struct ServerPool {
    servers: ArcSwap<Vec<NumberedServer>>,
    // serializes edits; readers go through the ArcSwap only
    edit_lock: Mutex<()>,
    cache: Option<Arc<dyn PacketCache>>,
    policy: ArcSwapOption<LbPolicy>,
    use_ecs: AtomicBool,
    zero_scope: AtomicBool,
}

impl Default for ServerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerPool {
    /// An empty pool without a cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            servers: ArcSwap::from_pointee(Vec::new()),
            edit_lock: Mutex::new(()),
            cache: None,
            policy: ArcSwapOption::empty(),
            use_ecs: AtomicBool::new(false),
            zero_scope: AtomicBool::new(false),
        }
    }

    /// An empty pool carrying a response cache.
    #[must_use]
    pub fn with_cache(cache: Arc<dyn PacketCache>) -> Self {
        let pool = Self::new();
        Self {
            cache: Some(cache),
            ..pool
        }
    }

    /// The pool's cache, if one is attached.
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<dyn PacketCache>> {
        self.cache.as_ref()
    }

    /// The current server snapshot.
    #[must_use]
    pub fn servers(&self) -> Arc<Vec<NumberedServer>> {
        self.servers.load_full()
    }

    /// Number of servers, optionally counting only up ones.
    #[must_use]
    pub fn count_servers(&self, up_only: bool) -> usize {
        self.servers
            .load()
            .iter()
            .filter(|entry| !up_only || entry.server.is_up())
            .count()
    }

    /// Add a backend and publish the re-sorted, renumbered vector.
    pub fn add_server(&self, server: Arc<Backend>) {
        let _guard = self.edit_lock.lock();
        let mut next: Vec<NumberedServer> = (**self.servers.load()).clone();
        next.push(NumberedServer {
            position: 0,
            server,
        });
        Self::sort_and_renumber(&mut next);
        self.servers.store(Arc::new(next));
    }

    /// Remove a backend by identity. Returns whether it was present.
    pub fn remove_server(&self, id: Uuid) -> bool {
        let _guard = self.edit_lock.lock();
        let mut next: Vec<NumberedServer> = (**self.servers.load()).clone();
        let before = next.len();
        next.retain(|entry| entry.server.id != id);
        let removed = next.len() != before;
        if removed {
            Self::sort_and_renumber(&mut next);
            self.servers.store(Arc::new(next));
        }
        removed
    }

    /// Re-sort and renumber the published vector, for use after a backend's
    /// order or weight changed.
    pub fn resort(&self) {
        let _guard = self.edit_lock.lock();
        let mut next: Vec<NumberedServer> = (**self.servers.load()).clone();
        Self::sort_and_renumber(&mut next);
        self.servers.store(Arc::new(next));
    }

    fn sort_and_renumber(servers: &mut [NumberedServer]) {
        servers.sort_by_key(|entry| entry.server.order());
        for (index, entry) in servers.iter_mut().enumerate() {
            entry.position = index as u32 + 1;
        }
    }

    /// The pool's policy override, if set.
    #[must_use]
    pub fn policy(&self) -> Option<Arc<LbPolicy>> {
        self.policy.load_full()
    }

    /// Set or clear the policy override.
    pub fn set_policy(&self, policy: Option<LbPolicy>) {
        self.policy.store(policy.map(Arc::new));
    }

    /// Whether queries through this pool carry the client subnet.
    #[must_use]
    pub fn use_ecs(&self) -> bool {
        self.use_ecs.load(Ordering::Relaxed)
    }

    /// Toggle client-subnet forwarding.
    pub fn set_use_ecs(&self, use_ecs: bool) {
        self.use_ecs.store(use_ecs, Ordering::Relaxed);
    }

    /// Whether zero-scope responses are cached without the client subnet.
    #[must_use]
    pub fn zero_scope(&self) -> bool {
        self.zero_scope.load(Ordering::Relaxed)
    }

    /// Toggle zero-scope caching.
    pub fn set_zero_scope(&self, zero_scope: bool) {
        self.zero_scope.store(zero_scope, Ordering::Relaxed);
    }
}
