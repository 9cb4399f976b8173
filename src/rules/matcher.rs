//! Rule matchers
//!
//! A matcher decides whether a rule applies to a query. The built-in set is
//! a sum type evaluated directly; operators plug custom logic through the
//! small [`DnsRule`] trait without touching the built-in walk.

use std::fmt;
use std::sync::Arc;

use hickory_proto::rr::{DNSClass, Name, RecordType};
use rand::Rng;

use crate::acl::NetmaskGroup;
use crate::limiter::QpsLimiter;
use crate::question::QueryContext;

/// Custom match logic supplied by the embedding application.
pub trait DnsRule: Send + Sync + fmt::Debug {
    /// Whether the rule applies to this query.
    fn matches(&self, ctx: &QueryContext) -> bool;

    /// Short description for the operator surface.
    fn describe(&self) -> String;
}

/// The built-in matcher set.
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    /// Matches every query
    All,
    /// Matches a question type
    QTypeIs(RecordType),
    /// Matches a question class
    QClassIs(DNSClass),
    /// Matches when the question name equals or sits below the suffix
    QNameSuffix(Name),
    /// Matches when the client address falls in the group
    SourceIn(NetmaskGroup),
    /// Matches by transport: `true` for stream transports
    OverTcp(bool),
    /// Matches when the query has the RD bit set
    RecursionDesired,
    /// Matches once the shared limiter is exceeded
    ///
    /// The limiter is consulted per evaluation, so placing this in front
    /// of a Drop action implements "drop above N qps".
    MaxQps(Arc<QpsLimiter>),
    /// Matches a fraction of queries uniformly at random
    Probability(f64),
    /// Matches when every inner matcher matches
    And(Vec<RuleMatcher>),
    /// Matches when any inner matcher matches
    Or(Vec<RuleMatcher>),
    /// Inverts the inner matcher
    Not(Box<RuleMatcher>),
    /// Custom logic behind the [`DnsRule`] trait
    Custom(Arc<dyn DnsRule>),
}

impl RuleMatcher {
    /// Evaluate the matcher against a query.
    #[must_use]
    pub fn matches(&self, ctx: &QueryContext) -> bool {
        match self {
            Self::All => true,
            Self::QTypeIs(qtype) => ctx.qtype == *qtype,
            Self::QClassIs(qclass) => ctx.qclass == *qclass,
            Self::QNameSuffix(suffix) => suffix.zone_of(&ctx.qname),
            Self::SourceIn(group) => group.matches(ctx.remote.ip()),
            Self::OverTcp(tcp) => ctx.tcp == *tcp,
            Self::RecursionDesired => ctx.orig_flags & 0x0100 != 0,
            Self::MaxQps(limiter) => !limiter.check(),
            Self::Probability(p) => rand::thread_rng().gen_bool(p.clamp(0.0, 1.0)),
            Self::And(inner) => inner.iter().all(|m| m.matches(ctx)),
            Self::Or(inner) => inner.iter().any(|m| m.matches(ctx)),
            Self::Not(inner) => !inner.matches(ctx),
            Self::Custom(rule) => rule.matches(ctx),
        }
    }

    /// Short description for the operator surface.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::QTypeIs(qtype) => format!("qtype=={qtype}"),
            Self::QClassIs(qclass) => format!("qclass=={qclass:?}"),
            Self::QNameSuffix(suffix) => format!("qname under {suffix}"),
            Self::SourceIn(group) => format!("source in [{group}]"),
            Self::OverTcp(true) => "over tcp".to_string(),
            Self::OverTcp(false) => "over udp".to_string(),
            Self::RecursionDesired => "rd set".to_string(),
            Self::MaxQps(limiter) => format!("above {} qps", limiter.rate()),
            Self::Probability(p) => format!("probability {p}"),
            Self::And(inner) => inner
                .iter()
                .map(Self::describe)
                .collect::<Vec<_>>()
                .join(" && "),
            Self::Or(inner) => inner
                .iter()
                .map(Self::describe)
                .collect::<Vec<_>>()
                .join(" || "),
            Self::Not(inner) => format!("!({})", inner.describe()),
            Self::Custom(rule) => rule.describe(),
        }
    }
}
