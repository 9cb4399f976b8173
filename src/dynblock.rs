//! Dynamic block tables
//!
//! Temporary bans keyed two ways: by client network (longest prefix wins)
//! and by DNS name suffix (longest suffix wins). Entries carry an expiry,
//! an optional action overriding the global one, a warning flag that counts
//! without enforcing, and an atomic hit counter shared across published
//! snapshots.
//!
//! Expired entries are skipped lazily on lookup; the maintenance task calls
//! `purge_expired` to actually drop them.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ipnet::IpNet;

use crate::rules::ActionKind;

/// One temporary ban.
#[derive(Debug)]
pub struct DynBlock {
    /// Operator-facing reason, shown when the block fires
    pub reason: String,
    /// The block stops applying at this instant
    pub until: Instant,
    /// Action override; the global dynamic-block action applies when unset
    pub action: Option<ActionKind>,
    /// Count matches without enforcing anything
    pub warning: bool,
    /// Whether an external socket filter also enforces this block
    pub bpf: bool,
    /// Queries this block matched
    pub blocks: AtomicU64,
}

impl DynBlock {
    /// Create a ban lasting until `until`.
    #[must_use]
    pub fn new(reason: impl Into<String>, until: Instant) -> Self {
        Self {
            reason: reason.into(),
            until,
            action: None,
            warning: false,
            bpf: false,
            blocks: AtomicU64::new(0),
        }
    }

    /// Set an action override.
    #[must_use]
    pub fn with_action(mut self, action: ActionKind) -> Self {
        self.action = Some(action);
        self
    }

    /// Mark as warning-only.
    #[must_use]
    pub fn warning_only(mut self) -> Self {
        self.warning = true;
        self
    }

    /// Whether the ban still applies at `now`.
    #[must_use]
    pub fn is_active(&self, now: Instant) -> bool {
        now < self.until
    }

    /// Count one match.
    pub fn record_hit(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Matches so far.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Address table
// ============================================================================

/// Blocks keyed by client network, longest prefix first.
///
/// Entries are bucketed by prefix length; a lookup walks the lengths from
/// most to least specific and probes the truncated candidate network, so
/// cost scales with the number of distinct prefix lengths in the table.
#[derive(Debug, Clone, Default)]
pub struct AddressBlockTable {
    buckets: BTreeMap<u8, HashMap<IpNet, Arc<DynBlock>>>,
}

impl AddressBlockTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the block for a network.
    pub fn insert(&mut self, net: IpNet, block: DynBlock) {
        self.buckets
            .entry(net.prefix_len())
            .or_default()
            .insert(net.trunc(), Arc::new(block));
    }

    /// Remove the block for a network, if present.
    pub fn remove(&mut self, net: &IpNet) -> Option<Arc<DynBlock>> {
        let bucket = self.buckets.get_mut(&net.prefix_len())?;
        let removed = bucket.remove(&net.trunc());
        if bucket.is_empty() {
            self.buckets.remove(&net.prefix_len());
        }
        removed
    }

    /// Most specific live block covering `addr`, if any.
    #[must_use]
    pub fn lookup(&self, addr: IpAddr, now: Instant) -> Option<Arc<DynBlock>> {
        let family_bits: u8 = if addr.is_ipv4() { 32 } else { 128 };
        for (&prefix, bucket) in self.buckets.iter().rev() {
            if prefix > family_bits {
                continue;
            }
            let Ok(candidate) = IpNet::new(addr, prefix) else {
                continue;
            };
            if let Some(block) = bucket.get(&candidate.trunc()) {
                if block.is_active(now) {
                    return Some(Arc::clone(block));
                }
            }
        }
        None
    }

    /// Drop entries whose expiry has passed. Returns how many were removed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            bucket.retain(|_, block| {
                let keep = block.is_active(now);
                if !keep {
                    removed += 1;
                }
                keep
            });
            !bucket.is_empty()
        });
        removed
    }

    /// Number of entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(HashMap::len).sum()
    }

    /// Whether the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate all entries for status reporting.
    pub fn entries(&self) -> impl Iterator<Item = (&IpNet, &Arc<DynBlock>)> {
        self.buckets.values().flat_map(HashMap::iter)
    }
}

// ============================================================================
// Suffix table
// ============================================================================

/// Blocks keyed by DNS name suffix, longest suffix first.
#[derive(Debug, Clone, Default)]
pub struct SuffixBlockTable {
    suffixes: HashMap<String, Arc<DynBlock>>,
}

/// Normalize a name for suffix keying: lowercase, no trailing dot.
fn normalize(name: &str) -> String {
    let name = name.to_lowercase();
    name.strip_suffix('.').map_or(name.clone(), str::to_string)
}

impl SuffixBlockTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the block for a suffix.
    pub fn insert(&mut self, suffix: &str, block: DynBlock) {
        self.suffixes.insert(normalize(suffix), Arc::new(block));
    }

    /// Remove the block for a suffix, if present.
    pub fn remove(&mut self, suffix: &str) -> Option<Arc<DynBlock>> {
        self.suffixes.remove(&normalize(suffix))
    }

    /// Most specific live block covering `qname`, if any.
    ///
    /// Walks from the full name towards the root, stripping one label per
    /// step, so `www.evil.test` probes `www.evil.test`, `evil.test`,
    /// `test` in that order.
    #[must_use]
    pub fn lookup(&self, qname: &str, now: Instant) -> Option<Arc<DynBlock>> {
        if self.suffixes.is_empty() {
            return None;
        }
        let mut candidate = normalize(qname);
        loop {
            if let Some(block) = self.suffixes.get(&candidate) {
                if block.is_active(now) {
                    return Some(Arc::clone(block));
                }
            }
            match candidate.split_once('.') {
                Some((_, rest)) => candidate = rest.to_string(),
                None => return None,
            }
        }
    }

    /// Drop entries whose expiry has passed. Returns how many were removed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.suffixes.len();
        self.suffixes.retain(|_, block| block.is_active(now));
        before - self.suffixes.len()
    }

    /// Number of entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    /// Whether the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    /// Iterate all entries for status reporting.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &Arc<DynBlock>)> {
        self.suffixes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn in_a_minute() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn in_the_past() -> Instant {
        Instant::now() - Duration::from_secs(1)
    }

    // ========================================================================
    // Address Table Tests
    // ========================================================================

    #[test]
    fn test_address_lookup_prefers_longest_prefix() {
        let mut table = AddressBlockTable::new();
        table.insert(
            "10.0.0.0/8".parse().unwrap(),
            DynBlock::new("wide", in_a_minute()),
        );
        table.insert(
            "10.1.0.0/16".parse().unwrap(),
            DynBlock::new("narrow", in_a_minute()),
        );

        let hit = table
            .lookup("10.1.2.3".parse().unwrap(), Instant::now())
            .expect("match");
        assert_eq!(hit.reason, "narrow");

        let hit = table
            .lookup("10.2.0.1".parse().unwrap(), Instant::now())
            .expect("match");
        assert_eq!(hit.reason, "wide");

        assert!(table
            .lookup("192.0.2.1".parse().unwrap(), Instant::now())
            .is_none());
    }

    #[test]
    fn test_address_lookup_skips_expired() {
        let mut table = AddressBlockTable::new();
        table.insert(
            "10.0.0.0/8".parse().unwrap(),
            DynBlock::new("old", in_the_past()),
        );
        assert!(table
            .lookup("10.1.2.3".parse().unwrap(), Instant::now())
            .is_none());
        // lazily skipped, still stored
        assert_eq!(table.len(), 1);
        assert_eq!(table.purge_expired(Instant::now()), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_address_table_handles_both_families() {
        let mut table = AddressBlockTable::new();
        table.insert(
            "2001:db8::/32".parse().unwrap(),
            DynBlock::new("v6", in_a_minute()),
        );
        assert!(table
            .lookup("2001:db8::1".parse().unwrap(), Instant::now())
            .is_some());
        assert!(table
            .lookup("10.0.0.1".parse().unwrap(), Instant::now())
            .is_none());
    }

    #[test]
    fn test_address_hit_counter_shared_across_clones() {
        let mut table = AddressBlockTable::new();
        table.insert(
            "10.0.0.0/8".parse().unwrap(),
            DynBlock::new("count", in_a_minute()),
        );
        let snapshot = table.clone();
        snapshot
            .lookup("10.0.0.1".parse().unwrap(), Instant::now())
            .unwrap()
            .record_hit();
        let original = table
            .lookup("10.0.0.1".parse().unwrap(), Instant::now())
            .unwrap();
        assert_eq!(original.hits(), 1);
    }

    // ========================================================================
    // Suffix Table Tests
    // ========================================================================

    #[test]
    fn test_suffix_lookup_walks_labels() {
        let mut table = SuffixBlockTable::new();
        table.insert("evil.test", DynBlock::new("ban", in_a_minute()));

        assert!(table.lookup("www.evil.test.", Instant::now()).is_some());
        assert!(table.lookup("EVIL.TEST", Instant::now()).is_some());
        assert!(table.lookup("good.test.", Instant::now()).is_none());
        // not a label boundary
        assert!(table.lookup("notevil.test.", Instant::now()).is_none());
    }

    #[test]
    fn test_suffix_lookup_prefers_longest_suffix() {
        let mut table = SuffixBlockTable::new();
        table.insert("test", DynBlock::new("tld", in_a_minute()));
        table.insert("evil.test", DynBlock::new("host", in_a_minute()));

        let hit = table.lookup("www.evil.test.", Instant::now()).unwrap();
        assert_eq!(hit.reason, "host");
        let hit = table.lookup("other.test.", Instant::now()).unwrap();
        assert_eq!(hit.reason, "tld");
    }

    #[test]
    fn test_suffix_expiry_and_purge() {
        let mut table = SuffixBlockTable::new();
        table.insert("evil.test", DynBlock::new("old", in_the_past()));
        assert!(table.lookup("evil.test.", Instant::now()).is_none());
        assert_eq!(table.purge_expired(Instant::now()), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_warning_flag_and_action_override() {
        let block = DynBlock::new("warn", in_a_minute()).warning_only();
        assert!(block.warning);
        let block = DynBlock::new("refuse", in_a_minute()).with_action(ActionKind::Refused);
        assert_eq!(block.action, Some(ActionKind::Refused));
    }
}
