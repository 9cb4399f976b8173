//! In-flight query correlation table
//!
//! Every backend owns a fixed-capacity table of slots. Forwarding a query
//! claims a slot by round-robin cursor, stores everything needed to answer
//! the original client, and rewrites the forwarded packet's transaction id
//! to the slot index. The responder finds the slot straight from the id of
//! the backend's answer.
//!
//! # Reuse and the ABA hazard
//!
//! A claimed slot is not necessarily free: the previous query's response
//! may simply never have arrived. In that case the slot is reused and the
//! stale entry discarded, without touching the outstanding count.
//!
//! Releasing is where ABA bites: between a responder reading a slot and
//! committing its release, the slot can be legitimately reused for a new
//! query. The usage indicator is therefore not a flag but a 64-bit value
//! carrying a per-slot 32-bit generation (sentinel -1 meaning free), and
//! release is a compare-exchange on the exact value read. A reuse bumps the
//! generation, the compare-exchange fails, and the late response is
//! dropped instead of stealing the fresh entry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::rr::{DNSClass, Name, RecordType};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use uuid::Uuid;

use crate::cache::CacheKey;
use crate::frontend::FrontendStats;
use crate::question::QueryContext;
use crate::stopwatch::StopWatch;

/// Indicator value of a free slot.
pub const UNUSED_INDICATOR: i64 = -1;

/// Everything needed to answer the original client once the backend
/// responds.
#[derive(Debug)]
pub struct SlotPayload {
    /// Frontend socket the reply goes out on
    pub origin_socket: Arc<UdpSocket>,
    /// The client to answer
    pub client: SocketAddr,
    /// The listener address the query arrived on
    pub dest: SocketAddr,
    /// Pre-rewrite addresses when a proxy header was consumed
    pub hop_remote: Option<SocketAddr>,
    /// See `hop_remote`
    pub hop_local: Option<SocketAddr>,
    /// Counters of the frontend the query arrived on
    pub frontend: Arc<FrontendStats>,
    /// Suppress the reply entirely (blackhole frontends)
    pub muted: bool,
    /// Started when the query left for the backend
    pub sent_time: StopWatch,
    /// Question name, for response correlation
    pub qname: Name,
    /// Question type, for response correlation
    pub qtype: RecordType,
    /// Question class, for response correlation
    pub qclass: DNSClass,
    /// The client's transaction id, restored on the reply
    pub orig_id: u16,
    /// The client's header flags
    pub orig_flags: u16,
    /// Response delay budget in milliseconds
    pub delay_ms: u32,
    /// Pool the query was routed through
    pub pool_name: String,
    /// Fingerprint to insert the response under, when caching applies
    pub cache_key: Option<CacheKey>,
    /// Fingerprint without the client subnet, for zero-scope insertion
    pub cache_key_no_ecs: Option<CacheKey>,
    /// Skip cache insertion for this response
    pub skip_cache: bool,
    /// Key the cache without the client subnet
    pub use_zero_scope: bool,
    /// The engine added a client-subnet option on the way out
    pub ecs_added: bool,
    /// The engine added an OPT record on the way out
    pub edns_added: bool,
    /// DO bit of the original query
    pub dnssec_ok: bool,
    /// TTL override for cached failure responses
    pub temp_failure_ttl: Option<u32>,
    /// Correlation id
    pub unique_id: Option<Uuid>,
    /// Sweeps survived while in flight
    pub age: u16,
}

impl SlotPayload {
    /// Capture the reply state of a query about to be forwarded.
    #[must_use]
    pub fn from_query(
        ctx: &QueryContext,
        origin_socket: Arc<UdpSocket>,
        frontend: Arc<FrontendStats>,
        muted: bool,
        cache_key: Option<CacheKey>,
        cache_key_no_ecs: Option<CacheKey>,
    ) -> Self {
        Self {
            origin_socket,
            frontend,
            client: ctx.remote,
            dest: ctx.local,
            hop_remote: ctx.hop_remote,
            hop_local: ctx.hop_local,
            muted,
            sent_time: StopWatch::started(),
            qname: ctx.qname.clone(),
            qtype: ctx.qtype,
            qclass: ctx.qclass,
            orig_id: ctx.id().unwrap_or(0),
            orig_flags: ctx.orig_flags,
            delay_ms: ctx.delay_ms,
            pool_name: ctx.pool_name.clone(),
            cache_key,
            cache_key_no_ecs,
            skip_cache: ctx.skip_cache,
            use_zero_scope: ctx.use_zero_scope,
            ecs_added: ctx.ecs_added,
            edns_added: ctx.edns_added,
            dnssec_ok: ctx.dnssec_ok,
            temp_failure_ttl: ctx.temp_failure_ttl,
            unique_id: ctx.unique_id,
            age: 0,
        }
    }
}

#[derive(Debug)]
struct InflightSlot {
    /// -1 when free, otherwise the widened generation of the occupant
    usage: AtomicI64,
    /// Bumped on every claim; the ABA guard
    generation: AtomicU32,
    payload: Mutex<Option<SlotPayload>>,
}

impl InflightSlot {
    fn new() -> Self {
        Self {
            usage: AtomicI64::new(UNUSED_INDICATOR),
            generation: AtomicU32::new(0),
            payload: Mutex::new(None),
        }
    }
}

/// Result of claiming a slot.
#[derive(Debug, Clone, Copy)]
pub struct Claimed {
    /// The slot index; also the transaction id of the forwarded packet
    pub index: u16,
    /// Whether a stale in-flight entry was discarded by this claim
    pub reused: bool,
}

/// Outcome of a release attempt.
#[derive(Debug)]
pub enum Release {
    /// The caller owns the payload and must answer the client
    Owned(SlotPayload),
    /// The slot content does not correspond to this response
    Mismatch,
    /// The slot was free or won by someone else
    Lost,
}

/// Fixed-capacity correlation table, one per backend.
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<InflightSlot>,
    cursor: AtomicU64,
    outstanding: AtomicU64,
}

impl SlotTable {
    /// Create a table of `capacity` slots. Capacity is clamped to the
    /// 16-bit id space the forwarded packets index with.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, usize::from(u16::MAX) + 1);
        Self {
            slots: (0..capacity).map(|_| InflightSlot::new()).collect(),
            cursor: AtomicU64::new(0),
            outstanding: AtomicU64::new(0),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Queries currently awaiting a backend response.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Claim the next slot for `payload`.
    ///
    /// The non-atomic payload is stored first; the store of the new
    /// generation into the usage indicator publishes it. When the previous
    /// indicator was not the free sentinel, the slot was reused and the
    /// outstanding count is left alone.
    pub fn claim(&self, payload: SlotPayload) -> Claimed {
        let index = (self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len() as u64) as u16;
        let slot = &self.slots[usize::from(index)];

        *slot.payload.lock() = Some(payload);
        let generation = slot.generation.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let previous = slot.usage.swap(i64::from(generation), Ordering::AcqRel);

        let reused = previous != UNUSED_INDICATOR;
        if !reused {
            self.outstanding.fetch_add(1, Ordering::Relaxed);
        }
        Claimed { index, reused }
    }

    /// Try to take ownership of slot `index` for a response carrying the
    /// given question.
    ///
    /// The content check runs before the commit; a response whose question
    /// does not match the slot is dropped without touching it. The commit
    /// is a compare-exchange against the indicator value read up front, so
    /// of two racing responders exactly one obtains the payload.
    pub fn try_release(
        &self,
        index: u16,
        qname: &Name,
        qtype: RecordType,
        qclass: DNSClass,
    ) -> Release {
        let Some(slot) = self.slots.get(usize::from(index)) else {
            return Release::Lost;
        };
        let expected = slot.usage.load(Ordering::Acquire);
        if expected == UNUSED_INDICATOR {
            return Release::Lost;
        }

        let mut guard = slot.payload.lock();
        match guard.as_ref() {
            Some(p) if p.qname == *qname && p.qtype == qtype && p.qclass == qclass => {}
            _ => return Release::Mismatch,
        }

        if slot
            .usage
            .compare_exchange(expected, UNUSED_INDICATOR, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.outstanding.fetch_sub(1, Ordering::Relaxed);
            match guard.take() {
                Some(payload) => Release::Owned(payload),
                // the claim that will overwrite this payload has not run yet
                None => Release::Lost,
            }
        } else {
            Release::Lost
        }
    }

    /// Unconditionally release slot `index`, returning its payload.
    ///
    /// For the sender's own error path: a claim whose send failed must not
    /// linger until the timeout sweep.
    pub fn force_release(&self, index: u16) -> Option<SlotPayload> {
        let slot = self.slots.get(usize::from(index))?;
        let expected = slot.usage.load(Ordering::Acquire);
        if expected == UNUSED_INDICATOR {
            return None;
        }
        let mut guard = slot.payload.lock();
        if slot
            .usage
            .compare_exchange(expected, UNUSED_INDICATOR, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.outstanding.fetch_sub(1, Ordering::Relaxed);
            guard.take()
        } else {
            None
        }
    }

    /// Force-release every slot whose query has been in flight longer than
    /// `timeout`, returning the payloads so the caller can account for the
    /// timeouts and notify any attached back-channel.
    ///
    /// Slots still inside the timeout get their age bumped. Idempotent:
    /// racing with a responder, only one side obtains each payload.
    pub fn harvest_expired(&self, timeout: Duration) -> Vec<SlotPayload> {
        let timeout_us = timeout.as_micros() as f64;
        let mut harvested = Vec::new();
        for slot in &self.slots {
            let expected = slot.usage.load(Ordering::Acquire);
            if expected == UNUSED_INDICATOR {
                continue;
            }
            let mut guard = slot.payload.lock();
            let expired = match guard.as_mut() {
                Some(payload) => {
                    if payload.sent_time.udiff() > timeout_us {
                        true
                    } else {
                        payload.age = payload.age.saturating_add(1);
                        false
                    }
                }
                // in-use indicator without a payload: a racing release took
                // the payload out from under a claim, reclaim the slot
                None => true,
            };
            if !expired {
                continue;
            }
            if slot
                .usage
                .compare_exchange(expected, UNUSED_INDICATOR, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.outstanding.fetch_sub(1, Ordering::Relaxed);
                if let Some(payload) = guard.take() {
                    harvested.push(payload);
                }
            }
        }
        harvested
    }

    /// Force-release every occupied slot, regardless of age. Used when a
    /// backend stops.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        for slot in &self.slots {
            let expected = slot.usage.load(Ordering::Acquire);
            if expected == UNUSED_INDICATOR {
                continue;
            }
            let mut guard = slot.payload.lock();
            if slot
                .usage
                .compare_exchange(expected, UNUSED_INDICATOR, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.outstanding.fetch_sub(1, Ordering::Relaxed);
                guard.take();
                drained += 1;
            }
        }
        drained
    }
}
