//! Query and response views
//!
//! A `QueryContext` is the mutable view the engine carries through the rule
//! pipeline: the raw packet buffer plus the parsed question, addressing
//! information, cache keys and the per-query flags rules may set. The same
//! shape serves the return path, rebuilt from the in-flight slot when a
//! backend answers.
//!
//! Raw header accessors operate on the first twelve octets of the buffer so
//! the forwarded packet itself never has to be re-encoded; only the engine's
//! synthesized answers go through full message building.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use uuid::Uuid;

use crate::cache::CacheKey;
use crate::error::{Error, Result};

/// Size of the fixed DNS header.
pub const DNS_HEADER_SIZE: usize = 12;

/// Largest packet accepted or produced over UDP.
pub const MAX_UDP_PACKET_SIZE: usize = 4096;

/// Largest packet accepted or produced over TCP.
pub const MAX_TCP_PACKET_SIZE: usize = 65535;

// ============================================================================
// Raw header accessors
// ============================================================================

const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_AD: u16 = 0x0020;

fn header_checked(buf: &[u8]) -> Result<&[u8]> {
    if buf.len() < DNS_HEADER_SIZE {
        return Err(Error::internal(format!(
            "accessing the header of a too small ({}) packet buffer",
            buf.len()
        )));
    }
    Ok(buf)
}

/// Transaction id of the packet.
pub fn dns_id(buf: &[u8]) -> Result<u16> {
    let buf = header_checked(buf)?;
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Overwrite the transaction id in place.
pub fn set_dns_id(buf: &mut [u8], id: u16) -> Result<()> {
    header_checked(buf)?;
    buf[0..2].copy_from_slice(&id.to_be_bytes());
    Ok(())
}

/// The sixteen header flag bits.
pub fn dns_flags(buf: &[u8]) -> Result<u16> {
    let buf = header_checked(buf)?;
    Ok(u16::from_be_bytes([buf[2], buf[3]]))
}

/// Overwrite the sixteen header flag bits.
pub fn set_dns_flags(buf: &mut [u8], flags: u16) -> Result<()> {
    header_checked(buf)?;
    buf[2..4].copy_from_slice(&flags.to_be_bytes());
    Ok(())
}

/// Whether the QR bit is set.
pub fn is_response(buf: &[u8]) -> Result<bool> {
    Ok(dns_flags(buf)? & FLAG_QR != 0)
}

/// Whether the RD bit is set.
pub fn recursion_desired(buf: &[u8]) -> Result<bool> {
    Ok(dns_flags(buf)? & FLAG_RD != 0)
}

/// Clear the RD bit.
pub fn clear_recursion_desired(buf: &mut [u8]) -> Result<()> {
    let flags = dns_flags(buf)?;
    set_dns_flags(buf, flags & !FLAG_RD)
}

/// Set the TC bit and flip the packet into a response.
pub fn set_truncated_response(buf: &mut [u8]) -> Result<()> {
    let flags = dns_flags(buf)?;
    set_dns_flags(buf, flags | FLAG_QR | FLAG_TC)
}

/// Clear the AD bit.
pub fn clear_authentic_data(buf: &mut [u8]) -> Result<()> {
    let flags = dns_flags(buf)?;
    set_dns_flags(buf, flags & !FLAG_AD)
}

/// Opcode field (bits 11..14 of the flags).
pub fn opcode(buf: &[u8]) -> Result<u8> {
    Ok(((dns_flags(buf)? >> 11) & 0x0f) as u8)
}

/// Response code field (low four flag bits).
pub fn rcode(buf: &[u8]) -> Result<u8> {
    Ok((dns_flags(buf)? & 0x0f) as u8)
}

/// Turn the packet into a response carrying `rcode`, preserving the
/// question and the id.
pub fn set_rcode_response(buf: &mut [u8], rcode: u8) -> Result<()> {
    let flags = dns_flags(buf)?;
    set_dns_flags(buf, (flags & !0x0f) | FLAG_QR | u16::from(rcode & 0x0f))
}

/// Question section entry count.
pub fn qdcount(buf: &[u8]) -> Result<u16> {
    let buf = header_checked(buf)?;
    Ok(u16::from_be_bytes([buf[4], buf[5]]))
}

/// Answer section entry count.
pub fn ancount(buf: &[u8]) -> Result<u16> {
    let buf = header_checked(buf)?;
    Ok(u16::from_be_bytes([buf[6], buf[7]]))
}

/// Why an incoming packet failed the header sanity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderIssue {
    /// Shorter than the fixed DNS header
    TooShort,
    /// QR already set, this is a response
    NotAQuery,
    /// Opcode other than a standard query
    BadOpcode,
    /// No question in the question section
    EmptyQuestion,
    /// More than one question
    MultipleQuestions,
}

/// Sanity-check a client packet before any further processing.
///
/// Accepts exactly the packets the engine is willing to route: a standard
/// query with a single question.
pub fn check_query_header(buf: &[u8]) -> std::result::Result<(), HeaderIssue> {
    if buf.len() < DNS_HEADER_SIZE {
        return Err(HeaderIssue::TooShort);
    }
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    if flags & FLAG_QR != 0 {
        return Err(HeaderIssue::NotAQuery);
    }
    if (flags >> 11) & 0x0f != 0 {
        return Err(HeaderIssue::BadOpcode);
    }
    match u16::from_be_bytes([buf[4], buf[5]]) {
        0 => Err(HeaderIssue::EmptyQuestion),
        1 => Ok(()),
        _ => Err(HeaderIssue::MultipleQuestions),
    }
}

// ============================================================================
// Proxy protocol values
// ============================================================================

/// A type-length-value entry carried by an incoming proxy-protocol header.
#[derive(Debug, Clone)]
pub struct ProxyProtocolValue {
    /// TLV type octet
    pub kind: u8,
    /// Raw value bytes
    pub value: Bytes,
}

// ============================================================================
// Query context
// ============================================================================

/// The mutable per-query state threaded through the pipeline.
///
/// Constructed once per received packet, mutated by rules, consumed when the
/// packet is answered, forwarded or dropped. The response path rebuilds the
/// same shape from the in-flight slot.
#[derive(Debug)]
pub struct QueryContext {
    /// The raw packet, owned for the lifetime of the query
    pub packet: BytesMut,
    /// Parsed question name, lowercased
    pub qname: Name,
    /// Parsed question type
    pub qtype: RecordType,
    /// Parsed question class
    pub qclass: DNSClass,
    /// Address the listener received the packet on
    pub local: SocketAddr,
    /// Effective client address
    pub remote: SocketAddr,
    /// Receiving address before proxy-protocol rewriting, when present
    pub hop_local: Option<SocketAddr>,
    /// Sending address before proxy-protocol rewriting, when present
    pub hop_remote: Option<SocketAddr>,
    /// Proxy-protocol TLVs, when a header was consumed
    pub proxy_protocol_values: Option<Vec<ProxyProtocolValue>>,
    /// Whether the packet arrived over a stream transport
    pub tcp: bool,
    /// Receive timestamp
    pub received_at: Instant,
    /// Pool routing decision, empty selects the default pool
    pub pool_name: String,
    /// Client-subnet prefix length to use when forwarding with ECS
    pub ecs_prefix_length: u8,
    /// Whether an existing client-subnet option may be overridden
    pub ecs_override: bool,
    /// Correlation id assigned when forwarded
    pub unique_id: Option<Uuid>,
    /// Header flags as received, restored on the way back
    pub orig_flags: u16,
    /// Artificial delay budget for the response, in milliseconds
    pub delay_ms: u32,
    /// TTL override for temporary failures entering the cache
    pub temp_failure_ttl: Option<u32>,
    /// Skip cache lookup and insertion for this query
    pub skip_cache: bool,
    /// Whether client-subnet forwarding applies
    pub use_ecs: bool,
    /// Whether the engine added a client-subnet option
    pub ecs_added: bool,
    /// Whether the engine added an OPT record
    pub edns_added: bool,
    /// Whether zero-scope responses are cacheable across subnets
    pub use_zero_scope: bool,
    /// DO bit from the client's OPT record
    pub dnssec_ok: bool,
    /// Open-ended tags set by rules
    pub tags: Option<HashMap<String, String>>,
}

impl QueryContext {
    /// Parse the question out of `packet` and build the context.
    ///
    /// The packet must already have passed [`check_query_header`]; this
    /// returns a parse error when the question section is unreadable.
    pub fn from_packet(
        packet: BytesMut,
        local: SocketAddr,
        remote: SocketAddr,
        tcp: bool,
        received_at: Instant,
    ) -> Result<Self> {
        let message =
            Message::from_bytes(&packet).map_err(|e| Error::parse(format!("question: {e}")))?;
        let query = message
            .queries()
            .first()
            .ok_or_else(|| Error::parse("question section is empty"))?;
        let qname = query.name().to_lowercase();
        let qtype = query.query_type();
        let qclass = query.query_class();
        let dnssec_ok = message.edns().is_some_and(|e| e.dnssec_ok());
        let orig_flags = dns_flags(&packet)?;
        let ecs_prefix_length = if remote.is_ipv4() { 24 } else { 56 };

        Ok(Self {
            packet,
            qname,
            qtype,
            qclass,
            local,
            remote,
            hop_local: None,
            hop_remote: None,
            proxy_protocol_values: None,
            tcp,
            received_at,
            pool_name: String::new(),
            ecs_prefix_length,
            ecs_override: false,
            unique_id: None,
            orig_flags,
            delay_ms: 0,
            temp_failure_ttl: None,
            skip_cache: false,
            use_ecs: false,
            ecs_added: false,
            edns_added: false,
            use_zero_scope: false,
            dnssec_ok,
            tags: None,
        })
    }

    /// Largest size this packet may grow to on its transport.
    #[must_use]
    pub fn max_size(&self) -> usize {
        if self.tcp {
            MAX_TCP_PACKET_SIZE
        } else {
            MAX_UDP_PACKET_SIZE
        }
    }

    /// The transaction id of the carried packet.
    pub fn id(&self) -> Result<u16> {
        dns_id(&self.packet)
    }

    /// Cache fingerprint including the client subnet when ECS applies.
    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::from_question(self, self.use_ecs)
    }

    /// Cache fingerprint with the client subnet left out.
    ///
    /// Zero-scope caching keys on this value so one cached answer serves
    /// every subnet.
    #[must_use]
    pub fn cache_key_no_ecs(&self) -> CacheKey {
        CacheKey::from_question(self, false)
    }

    /// Attach a tag, creating the map on first use.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
    }

    /// Look up a tag.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.as_ref()?.get(key).map(String::as_str)
    }
}
