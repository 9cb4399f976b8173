//! Rule actions
//!
//! Actions are a closed set of effects a matched rule requests from the
//! engine. They deliberately carry their payload (pool name, spoof data,
//! delay) inside the variant so the pipeline stays a plain sum-type walk
//! with no dynamic dispatch on the hot path.

use std::net::IpAddr;

use bytes::{Bytes, BytesMut};
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::question::QueryContext;

/// TTL used for spoofed answers.
pub const SPOOF_TTL: u32 = 60;

/// Payload-free action kinds, usable where only the effect matters
/// (dynamic blocks, configuration defaults).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Discard the query silently
    Drop,
    /// Answer NXDomain
    Nxdomain,
    /// Answer Refused
    Refused,
    /// Answer ServFail
    ServFail,
    /// Answer truncated over UDP
    Truncate,
    /// Clear the RD bit and continue
    NoRecurse,
    /// Do nothing
    NoOp,
}

/// Header mutations a rule may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderMod {
    /// Clear the AD (authentic data) bit
    ClearAd,
    /// Clear the CD (checking disabled) bit
    ClearCd,
    /// Clear the RA (recursion available) bit
    ClearRa,
}

const FLAG_RA: u16 = 0x0080;
const FLAG_CD: u16 = 0x0010;

impl HeaderMod {
    /// Apply the mutation to a raw packet header.
    pub fn apply(self, buf: &mut [u8]) -> Result<()> {
        match self {
            Self::ClearAd => crate::question::clear_authentic_data(buf),
            Self::ClearCd => clear_flag(buf, FLAG_CD),
            Self::ClearRa => clear_flag(buf, FLAG_RA),
        }
    }
}

fn clear_flag(buf: &mut [u8], mask: u16) -> Result<()> {
    let flags = crate::question::dns_flags(buf)?;
    crate::question::set_dns_flags(buf, flags & !mask)
}

/// What a matched query rule does.
#[derive(Debug, Clone)]
pub enum Action {
    /// Discard silently
    Drop,
    /// Stop the rule walk and proceed to cache and backend selection
    Allow,
    /// Synthesize an NXDomain response
    Nxdomain,
    /// Synthesize a Refused response
    Refused,
    /// Synthesize a ServFail response
    ServFail,
    /// Synthesize an answer from the given addresses (A/AAAA as the
    /// question asks)
    Spoof(Vec<IpAddr>),
    /// Synthesize an answer from raw RDATA matching the question type
    SpoofRaw(Vec<Bytes>),
    /// Set TC and answer, UDP only; ignored on stream transports
    Truncate,
    /// Clear the RD bit, then continue the walk
    NoRecurse,
    /// Mutate a header bit, then continue the walk
    HeaderModify(HeaderMod),
    /// Route the query to the named pool, then continue the walk
    Pool(String),
    /// Defer the response by this many milliseconds, then continue
    Delay(u32),
    /// Match counting only
    NoOp,
}

impl Action {
    /// Human-readable effect, for the operator surface.
    #[must_use]
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Allow => "allow",
            Self::Nxdomain => "send NXDomain",
            Self::Refused => "send Refused",
            Self::ServFail => "send ServFail",
            Self::Spoof(_) => "spoof an answer",
            Self::SpoofRaw(_) => "spoof an answer from raw bytes",
            Self::Truncate => "truncate over UDP",
            Self::NoRecurse => "set rd=0",
            Self::HeaderModify(_) => "modify the header",
            Self::Pool(_) => "route to a pool",
            Self::Delay(_) => "delay",
            Self::NoOp => "do nothing",
        }
    }
}

/// What a matched response rule does. The reduced set valid on the
/// return path.
#[derive(Debug, Clone)]
pub enum ResponseAction {
    /// Stop the walk, deliver as-is
    Allow,
    /// Defer delivery by this many milliseconds, then continue
    Delay(u32),
    /// Discard the response
    Drop,
    /// Mutate a header bit, then continue the walk
    HeaderModify(HeaderMod),
    /// Replace the response with a ServFail
    ServFail,
    /// Match counting only
    None,
}

// ============================================================================
// Response synthesis
// ============================================================================

/// Build a response carrying `rcode` from the query in `ctx`, preserving
/// the question section, the id and the RD bit.
pub fn synthesize_rcode(ctx: &QueryContext, rcode: ResponseCode) -> Result<BytesMut> {
    let mut message = base_response(ctx);
    message.set_response_code(rcode);
    encode(&message)
}

/// Build a spoofed answer from addresses. Only addresses of the family the
/// question asks for are used; a question that is neither A nor AAAA gets
/// NXDomain instead.
pub fn synthesize_spoof(ctx: &QueryContext, addrs: &[IpAddr]) -> Result<BytesMut> {
    let rdatas: Vec<RData> = match ctx.qtype {
        RecordType::A => addrs
            .iter()
            .filter_map(|a| match a {
                IpAddr::V4(v4) => Some(RData::A(A(*v4))),
                IpAddr::V6(_) => None,
            })
            .collect(),
        RecordType::AAAA => addrs
            .iter()
            .filter_map(|a| match a {
                IpAddr::V6(v6) => Some(RData::AAAA(AAAA(*v6))),
                IpAddr::V4(_) => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    if rdatas.is_empty() {
        return synthesize_rcode(ctx, ResponseCode::NXDomain);
    }

    let mut message = base_response(ctx);
    message.set_response_code(ResponseCode::NoError);
    for rdata in rdatas {
        let mut record = Record::new();
        record.set_name(ctx.qname.clone());
        record.set_record_type(ctx.qtype);
        record.set_dns_class(ctx.qclass);
        record.set_ttl(SPOOF_TTL);
        record.set_data(Some(rdata));
        message.add_answer(record);
    }
    encode(&message)
}

/// Build a spoofed answer from raw RDATA blobs typed as the question asks.
///
/// Blobs that do not decode as the question type are carried as opaque
/// NULL rdata rather than rejected; the operator asked for these bytes.
pub fn synthesize_spoof_raw(ctx: &QueryContext, rdatas: &[Bytes]) -> Result<BytesMut> {
    use hickory_proto::rr::rdata::NULL;
    use hickory_proto::serialize::binary::{BinDecoder, Restrict};

    let mut message = base_response(ctx);
    message.set_response_code(ResponseCode::NoError);
    for raw in rdatas {
        let mut decoder = BinDecoder::new(raw);
        let rdata = RData::read(&mut decoder, ctx.qtype, Restrict::new(raw.len() as u16))
            .unwrap_or_else(|_| RData::NULL(NULL::with(raw.to_vec())));
        let mut record = Record::new();
        record.set_name(ctx.qname.clone());
        record.set_record_type(ctx.qtype);
        record.set_dns_class(ctx.qclass);
        record.set_ttl(SPOOF_TTL);
        record.set_data(Some(rdata));
        message.add_answer(record);
    }
    encode(&message)
}

fn base_response(ctx: &QueryContext) -> Message {
    let mut message = Message::new();
    message.set_id(ctx.id().unwrap_or(0));
    message.set_message_type(MessageType::Response);
    message.set_recursion_desired(ctx.orig_flags & 0x0100 != 0);
    let mut query = Query::query(ctx.qname.clone(), ctx.qtype);
    query.set_query_class(ctx.qclass);
    message.add_query(query);
    message
}

fn encode(message: &Message) -> Result<BytesMut> {
    let bytes = message
        .to_bytes()
        .map_err(|e| Error::serialize(format!("synthesized response: {e}")))?;
    Ok(BytesMut::from(&bytes[..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::question::test_support::query_context;
    use hickory_proto::op::Message;
    use hickory_proto::serialize::binary::BinDecodable;

    // ========================================================================
    // Synthesis Tests
    // ========================================================================

    #[test]
    fn test_rcode_synthesis_preserves_question_and_id() {
        let ctx = query_context("example.com.", RecordType::A, "10.0.0.1:1");
        let out = synthesize_rcode(&ctx, ResponseCode::NXDomain).unwrap();
        let message = Message::from_bytes(&out).unwrap();
        assert_eq!(message.id(), 0x1234);
        assert_eq!(message.response_code(), ResponseCode::NXDomain);
        assert_eq!(message.queries().len(), 1);
        assert_eq!(message.queries()[0].name().to_string(), "example.com.");
        assert!(message.recursion_desired());
    }

    #[test]
    fn test_spoof_a_answers_with_matching_family() {
        let ctx = query_context("spoofed.test.", RecordType::A, "10.0.0.1:1");
        let addrs = vec![
            "192.0.2.10".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
        ];
        let out = synthesize_spoof(&ctx, &addrs).unwrap();
        let message = Message::from_bytes(&out).unwrap();
        assert_eq!(message.answers().len(), 1);
        assert_eq!(message.answers()[0].ttl(), SPOOF_TTL);
    }

    #[test]
    fn test_spoof_without_usable_family_is_nxdomain() {
        let ctx = query_context("spoofed.test.", RecordType::AAAA, "10.0.0.1:1");
        let addrs = vec!["192.0.2.10".parse().unwrap()];
        let out = synthesize_spoof(&ctx, &addrs).unwrap();
        let message = Message::from_bytes(&out).unwrap();
        assert_eq!(message.response_code(), ResponseCode::NXDomain);
    }

    // ========================================================================
    // Header Mutation Tests
    // ========================================================================

    const FLAG_AD: u16 = 0x0020;

    #[test]
    fn test_header_mod_clears_ad() {
        let mut packet = crate::question::test_support::query_packet(
            "example.com.",
            RecordType::A,
            1,
        );
        let flags = crate::question::dns_flags(&packet).unwrap();
        crate::question::set_dns_flags(&mut packet, flags | FLAG_AD).unwrap();
        HeaderMod::ClearAd.apply(&mut packet).unwrap();
        assert_eq!(crate::question::dns_flags(&packet).unwrap() & FLAG_AD, 0);
    }

    #[test]
    fn test_action_describe() {
        assert_eq!(Action::Drop.describe(), "drop");
        assert_eq!(Action::Pool("abuse".into()).describe(), "route to a pool");
        assert_eq!(Action::Truncate.describe(), "truncate over UDP");
    }
}
