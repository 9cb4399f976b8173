//! Rule bindings and chains
//!
//! A `RuleAction` binds one matcher to one action under a stable identity:
//! a v4 UUID, an operator-facing name and a monotonically increasing
//! creation order. The creation order gives deterministic re-ordering when
//! chains are edited concurrently; published chains themselves live inside
//! [`crate::holder::Holder`] snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use super::action::{Action, ResponseAction};
use super::matcher::RuleMatcher;

static CREATION_ORDER: AtomicU64 = AtomicU64::new(0);

fn next_creation_order() -> u64 {
    CREATION_ORDER.fetch_add(1, Ordering::Relaxed)
}

/// A named query rule with its action and match counter.
#[derive(Debug)]
pub struct RuleAction {
    /// Stable identity
    pub id: Uuid,
    /// Operator-facing name
    pub name: String,
    /// Monotonic creation order, for deterministic re-ordering
    pub creation_order: u64,
    /// The match predicate
    pub matcher: RuleMatcher,
    /// The effect on match
    pub action: Action,
    /// Number of queries this rule matched
    pub matches: AtomicU64,
}

impl RuleAction {
    /// Bind a matcher to an action under a fresh identity.
    #[must_use]
    pub fn new(name: impl Into<String>, matcher: RuleMatcher, action: Action) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            creation_order: next_creation_order(),
            matcher,
            action,
            matches: AtomicU64::new(0),
        })
    }

    /// Times this rule matched.
    #[must_use]
    pub fn match_count(&self) -> u64 {
        self.matches.load(Ordering::Relaxed)
    }

    /// Count one match.
    pub fn record_match(&self) {
        self.matches.fetch_add(1, Ordering::Relaxed);
    }
}

/// A named response rule with its action and match counter.
#[derive(Debug)]
pub struct ResponseRuleAction {
    /// Stable identity
    pub id: Uuid,
    /// Operator-facing name
    pub name: String,
    /// Monotonic creation order
    pub creation_order: u64,
    /// The match predicate
    pub matcher: RuleMatcher,
    /// The effect on match
    pub action: ResponseAction,
    /// Number of responses this rule matched
    pub matches: AtomicU64,
}

impl ResponseRuleAction {
    /// Bind a matcher to a response action under a fresh identity.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        matcher: RuleMatcher,
        action: ResponseAction,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            creation_order: next_creation_order(),
            matcher,
            action,
            matches: AtomicU64::new(0),
        })
    }

    /// Times this rule matched.
    #[must_use]
    pub fn match_count(&self) -> u64 {
        self.matches.load(Ordering::Relaxed)
    }

    /// Count one match.
    pub fn record_match(&self) {
        self.matches.fetch_add(1, Ordering::Relaxed);
    }
}

/// An ordered query rule chain, as published in a holder snapshot.
pub type RuleChain = Vec<Arc<RuleAction>>;

/// An ordered response rule chain, as published in a holder snapshot.
pub type ResponseRuleChain = Vec<Arc<ResponseRuleAction>>;

/// Restore a chain to creation order, the deterministic baseline after
/// concurrent edits.
pub fn sort_by_creation(chain: &mut RuleChain) {
    chain.sort_by_key(|rule| rule.creation_order);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creation_order_is_monotonic() {
        let a = RuleAction::new("a", RuleMatcher::All, Action::NoOp);
        let b = RuleAction::new("b", RuleMatcher::All, Action::NoOp);
        assert!(a.creation_order < b.creation_order);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_match_counter() {
        let rule = RuleAction::new("count", RuleMatcher::All, Action::NoOp);
        assert_eq!(rule.match_count(), 0);
        rule.record_match();
        rule.record_match();
        assert_eq!(rule.match_count(), 2);
    }

    #[test]
    fn test_sort_by_creation_restores_order() {
        let a = RuleAction::new("a", RuleMatcher::All, Action::NoOp);
        let b = RuleAction::new("b", RuleMatcher::All, Action::NoOp);
        let c = RuleAction::new("c", RuleMatcher::All, Action::NoOp);
        let mut chain: RuleChain = vec![c.clone(), a.clone(), b.clone()];
        sort_by_creation(&mut chain);
        let names: Vec<&str> = chain.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }
}
