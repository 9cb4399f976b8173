//! Rule and action pipeline
//!
//! Queries and responses run through ordered chains of (matcher, action)
//! pairs. Matchers are a closed sum type with a custom-rule escape hatch,
//! actions a closed set of effects the engine translates; both are
//! evaluated without dynamic dispatch on the built-in path.
//!
//! Four chains exist, mirroring the query life-cycle:
//!
//! - query rules, on every accepted query
//! - response rules, on every backend response
//! - cache-hit response rules, only when the answer came from the cache
//! - self-answered response rules, for engine-synthesized answers

pub mod action;
pub mod matcher;
pub mod pipeline;

pub use action::{Action, ActionKind, HeaderMod, ResponseAction, SPOOF_TTL};
pub use matcher::{DnsRule, RuleMatcher};
pub use pipeline::{
    sort_by_creation, ResponseRuleAction, ResponseRuleChain, RuleAction, RuleChain,
};
