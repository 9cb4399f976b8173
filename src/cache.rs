//! Packet cache capability
//!
//! Pools may carry a response cache keyed by a query fingerprint. The engine
//! only depends on the narrow [`PacketCache`] trait; [`MokaPacketCache`] is
//! the bundled implementation on top of a `moka` sync cache.
//!
//! # Fingerprint
//!
//! The key covers everything that legitimately changes an answer: the
//! lowercased name, type, class, the relevant header flags (DO bit), the
//! transport and, when client-subnet forwarding is active, the client's
//! truncated network. Zero-scope handling uses the same key shape with the
//! subnet left out, so a zero-scope answer is shared across subnets.
//!
//! # Staleness
//!
//! Entries are kept for a configurable margin past their logical TTL.
//! Within that margin a lookup with `allow_stale` set still answers, which
//! is what serves clients while every backend of a pool is down.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use ipnet::IpNet;
use moka::sync::Cache;

use crate::error::{Error, Result};
use crate::question::QueryContext;

/// Default ceiling for a cacheable response, octets.
pub const DEFAULT_MAX_ENTRY_SIZE: usize = 4096;

/// Cache fingerprint for one query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    qname: String,
    qtype: u16,
    qclass: u16,
    tcp: bool,
    dnssec_ok: bool,
    ecs: Option<IpNet>,
}

impl CacheKey {
    /// Build the fingerprint for a query, with or without the client subnet.
    #[must_use]
    pub fn from_question(ctx: &QueryContext, with_ecs: bool) -> Self {
        let ecs = if with_ecs {
            client_subnet(ctx.remote.ip(), ctx.ecs_prefix_length)
        } else {
            None
        };
        Self {
            qname: ctx.qname.to_string().to_lowercase(),
            qtype: u16::from(ctx.qtype),
            qclass: u16::from(ctx.qclass),
            tcp: ctx.tcp,
            dnssec_ok: ctx.dnssec_ok,
            ecs,
        }
    }

    /// The lowercased query name.
    #[must_use]
    pub fn qname(&self) -> &str {
        &self.qname
    }

    /// Whether the fingerprint includes a client subnet.
    #[must_use]
    pub fn has_ecs(&self) -> bool {
        self.ecs.is_some()
    }
}

fn client_subnet(addr: IpAddr, prefix: u8) -> Option<IpNet> {
    IpNet::new(addr, prefix).ok().map(|net| net.trunc())
}

/// A cache hit: the stored response and how old it is.
#[derive(Debug, Clone)]
pub struct CachedAnswer {
    /// The response as inserted, with whatever id it carried then
    pub bytes: Bytes,
    /// Seconds the entry has spent in the cache
    pub age_secs: u32,
    /// Whether the entry was past its logical TTL when served
    pub stale: bool,
}

/// The capability a pool cache provides to the engine.
pub trait PacketCache: Send + Sync + std::fmt::Debug {
    /// Look up a fingerprint. `allow_stale` also accepts entries past
    /// their logical TTL but within the stale margin.
    fn lookup(&self, key: &CacheKey, now: Instant, allow_stale: bool) -> Option<CachedAnswer>;

    /// Store a response under a fingerprint.
    fn insert(&self, key: CacheKey, bytes: Bytes, ttl: Duration, now: Instant);

    /// Drop entries no longer servable, including stale ones.
    fn expunge_expired(&self, now: Instant);

    /// Number of stored entries.
    fn len(&self) -> usize;

    /// Whether the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tuning knobs for [`MokaPacketCache`].
#[derive(Debug, Clone)]
pub struct CacheTuning {
    /// Maximum number of entries
    pub max_entries: u64,
    /// Responses larger than this are not cached
    pub max_entry_size: usize,
    /// Lower clamp applied to inserted TTLs
    pub min_ttl: Duration,
    /// Upper clamp applied to inserted TTLs
    pub max_ttl: Duration,
    /// How long past the logical TTL an entry stays servable as stale
    pub stale_margin: Duration,
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            min_ttl: Duration::from_secs(0),
            max_ttl: Duration::from_secs(86_400),
            stale_margin: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    bytes: Bytes,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inserted_at)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.age(now) >= self.ttl
    }
}

/// Atomic hit and miss accounting for one cache instance.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    stale_served: AtomicU64,
    too_big: AtomicU64,
}

impl CacheStats {
    /// Lookup hits.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookup misses.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Successful inserts.
    #[must_use]
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Hits served past the logical TTL.
    #[must_use]
    pub fn stale_served(&self) -> u64 {
        self.stale_served.load(Ordering::Relaxed)
    }

    /// Inserts refused for exceeding the entry size ceiling.
    #[must_use]
    pub fn too_big(&self) -> u64 {
        self.too_big.load(Ordering::Relaxed)
    }
}

/// Moka-backed packet cache.
#[derive(Debug)]
pub struct MokaPacketCache {
    entries: Cache<CacheKey, CacheEntry>,
    tuning: CacheTuning,
    stats: CacheStats,
}

impl MokaPacketCache {
    /// Create a cache with the given tuning.
    #[must_use]
    pub fn new(tuning: CacheTuning) -> Self {
        // Physical retention covers the stale margin; logical expiry is
        // checked against the entry's own TTL on every lookup.
        let retention = tuning.max_ttl + tuning.stale_margin;
        let entries = Cache::builder()
            .max_capacity(tuning.max_entries)
            .time_to_live(retention)
            .build();
        Self {
            entries,
            tuning,
            stats: CacheStats::default(),
        }
    }

    /// Per-instance statistics.
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl PacketCache for MokaPacketCache {
    fn lookup(&self, key: &CacheKey, now: Instant, allow_stale: bool) -> Option<CachedAnswer> {
        let Some(entry) = self.entries.get(key) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let age = entry.age(now);
        if entry.is_expired(now) {
            let stale_deadline = entry.ttl + self.tuning.stale_margin;
            if allow_stale && age < stale_deadline {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                self.stats.stale_served.fetch_add(1, Ordering::Relaxed);
                return Some(CachedAnswer {
                    bytes: entry.bytes.clone(),
                    age_secs: entry.ttl.as_secs() as u32,
                    stale: true,
                });
            }
            self.entries.invalidate(key);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(CachedAnswer {
            bytes: entry.bytes.clone(),
            age_secs: age.as_secs() as u32,
            stale: false,
        })
    }

    fn insert(&self, key: CacheKey, bytes: Bytes, ttl: Duration, now: Instant) {
        if bytes.len() > self.tuning.max_entry_size {
            self.stats.too_big.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let ttl = ttl.clamp(self.tuning.min_ttl, self.tuning.max_ttl);
        self.entries.insert(
            key,
            CacheEntry {
                bytes,
                inserted_at: now,
                ttl,
            },
        );
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
    }

    fn expunge_expired(&self, now: Instant) {
        let margin = self.tuning.stale_margin;
        let dead: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.age(now) >= entry.ttl + margin)
            .map(|(key, _)| (*key).clone())
            .collect();
        for key in dead {
            self.entries.invalidate(&key);
        }
        self.entries.run_pending_tasks();
    }

    fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }
}

// ============================================================================
// Cached response preparation
// ============================================================================

/// Rewrite a cached response for delivery: the client's transaction id goes
/// back in and every record TTL is decremented by the entry age, clamped to
/// zero.
pub fn prepare_cached_response(answer: &CachedAnswer, id: u16) -> Result<BytesMut> {
    use hickory_proto::op::Message;
    use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

    let mut message = Message::from_bytes(&answer.bytes)
        .map_err(|e| Error::parse(format!("cached response: {e}")))?;
    message.set_id(id);

    let age = answer.age_secs;
    let decrement = |records: Vec<hickory_proto::rr::Record>| {
        records
            .into_iter()
            .map(|mut r| {
                let ttl = r.ttl().saturating_sub(age);
                r.set_ttl(ttl);
                r
            })
            .collect::<Vec<_>>()
    };

    let answers = decrement(message.take_answers());
    message.insert_answers(answers);
    let authorities = decrement(message.take_name_servers());
    message.insert_name_servers(authorities);
    let additionals = decrement(message.take_additionals());
    message.insert_additionals(additionals);

    let bytes = message
        .to_bytes()
        .map_err(|e| Error::serialize(format!("cached response: {e}")))?;
    Ok(BytesMut::from(&bytes[..]))
}

/// Shortest record TTL of a response, used as the cache TTL on insert.
pub fn response_min_ttl(bytes: &[u8]) -> Result<Option<u32>> {
    use hickory_proto::op::Message;
    use hickory_proto::serialize::binary::BinDecodable;

    let message =
        Message::from_bytes(bytes).map_err(|e| Error::parse(format!("response: {e}")))?;
    Ok(message.answers().iter().map(hickory_proto::rr::Record::ttl).min())
}
