//! The query life-cycle engine
//!
//! `process_query` drives an accepted packet through the fixed pipeline:
//! header sanity, ACL, dynamic blocks, the query rule chain, the pool
//! cache, and finally policy selection. The outcome is one of three
//! things: drop, answer from here, or forward to a chosen backend.
//!
//! `handle_backend_response` is the other half, invoked from the responder
//! loops: correlate through the in-flight table, validate, run the
//! response rule chain, feed the cache, restore the client's transaction
//! id and deliver.
//!
//! ```text
//! Received -> (sanity) -> Acl -> Dyn -> Rules -> [Cache?] --hit--> ClientReply
//!                                          |
//!                                          +--miss--> Policy -> Slot --send--> InFlight
//! InFlight --resp--> Correlate -> Release -> RespRules -> [CacheInsert] -> ClientReply
//! InFlight --timeout--> Release+Count
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use tracing::{debug, trace, warn};

use crate::backend::{Backend, Release, SlotPayload};
use crate::cache::{prepare_cached_response, response_min_ttl, CacheKey};
use crate::config::StaleCacheMode;
use crate::metrics::EngineStats;
use crate::pool::ServerPool;
use crate::question::{self, HeaderIssue, QueryContext, DNS_HEADER_SIZE};
use crate::rules::{Action, ActionKind, ResponseAction, ResponseRuleChain};
use crate::runtime::Runtime;

/// What the engine decided for a query.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Discard silently; counters already updated
    Drop,
    /// The context buffer now holds the response to deliver
    Answer,
    /// Forward to this backend
    Forward(Arc<Backend>),
}

/// How a rule walk ended.
enum RuleWalk {
    Fall,
    Drop,
    Answer,
}

/// The engine: pipeline glue over the shared runtime tables.
#[derive(Clone)]
pub struct QueryEngine {
    runtime: Arc<Runtime>,
    stats: Arc<EngineStats>,
}

impl QueryEngine {
    /// Build an engine over the runtime tables.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>, stats: Arc<EngineStats>) -> Self {
        Self { runtime, stats }
    }

    /// The shared counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// The shared runtime tables.
    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Header sanity for a raw client packet, with counting. `false`
    /// means the packet must be dropped without a reply.
    pub fn sanity_check(&self, buf: &[u8]) -> bool {
        match question::check_query_header(buf) {
            Ok(()) => true,
            Err(issue) => {
                if matches!(issue, HeaderIssue::TooShort | HeaderIssue::EmptyQuestion) {
                    self.stats.empty_queries.fetch_add(1, Ordering::Relaxed);
                }
                self.stats
                    .non_compliant_queries
                    .fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Run the full query pipeline.
    pub fn process_query(&self, ctx: &mut QueryContext) -> ProcessOutcome {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        if ctx.orig_flags & 0x0100 != 0 {
            self.stats.rd_queries.fetch_add(1, Ordering::Relaxed);
        }

        // ACL against the effective client address
        if !self.runtime.acl.load().matches(ctx.remote.ip()) {
            self.stats.acl_drops.fetch_add(1, Ordering::Relaxed);
            trace!(client = %ctx.remote, "query denied by ACL");
            return ProcessOutcome::Drop;
        }

        // dynamic blocks, address table first, then name suffixes
        let now = Instant::now();
        let block = self
            .runtime
            .dyn_block_addresses
            .load()
            .lookup(ctx.remote.ip(), now)
            .or_else(|| {
                self.runtime
                    .dyn_block_suffixes
                    .load()
                    .lookup(&ctx.qname.to_string(), now)
            });
        if let Some(block) = block {
            block.record_hit();
            if !block.warning {
                let action = block.action.unwrap_or(self.runtime.settings.dyn_block_action);
                self.stats.dyn_blocked.fetch_add(1, Ordering::Relaxed);
                debug!(client = %ctx.remote, qname = %ctx.qname, reason = %block.reason, "dynamic block");
                match self.apply_block_action(ctx, action) {
                    Some(outcome) => return outcome,
                    None => {} // NoRecurse / NoOp fall through
                }
            }
        }

        // query rule chain
        match self.apply_query_rules(ctx) {
            RuleWalk::Drop => return ProcessOutcome::Drop,
            RuleWalk::Answer => return ProcessOutcome::Answer,
            RuleWalk::Fall => {}
        }

        let pool = self.runtime.get_or_create_pool(&ctx.pool_name);
        ctx.use_ecs = pool.use_ecs();
        ctx.use_zero_scope = pool.zero_scope();

        // cache lookup
        if !ctx.skip_cache {
            if let Some(cache) = pool.cache() {
                let key = self.effective_cache_key(ctx);
                if let Some(hit) = cache.lookup(&key, now, false) {
                    self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    match prepare_cached_response(&hit, ctx.id().unwrap_or(0)) {
                        Ok(response) => {
                            ctx.packet = response;
                            let chain = self.runtime.cache_hit_rules.snapshot();
                            if !self.apply_response_rules(&chain, ctx) {
                                return ProcessOutcome::Drop;
                            }
                            return ProcessOutcome::Answer;
                        }
                        Err(e) => {
                            warn!(error = %e, "unusable cache entry, falling through");
                        }
                    }
                } else {
                    self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // policy selection over the pool snapshot
        let servers = pool.servers();
        let policy = pool.policy();
        let selected = match policy.as_deref() {
            Some(policy) => policy.select(&servers, ctx),
            None => self.runtime.policy.load().select(&servers, ctx),
        };
        // the selected backend still has to pass its own rate gate
        let selected = selected.filter(|server| server.limiter.check());

        match selected {
            Some(server) => ProcessOutcome::Forward(server),
            None => self.no_server_outcome(ctx, &pool, now),
        }
    }

    /// The configured behavior when no backend is usable: optionally serve
    /// a stale cache entry, otherwise ServFail or drop.
    fn no_server_outcome(
        &self,
        ctx: &mut QueryContext,
        pool: &ServerPool,
        now: Instant,
    ) -> ProcessOutcome {
        self.stats.no_policy.fetch_add(1, Ordering::Relaxed);

        if self.runtime.settings.stale_cache_mode == StaleCacheMode::ServeStale {
            if let Some(cache) = pool.cache() {
                let key = self.effective_cache_key(ctx);
                if let Some(hit) = cache.lookup(&key, now, true) {
                    if let Ok(response) = prepare_cached_response(&hit, ctx.id().unwrap_or(0)) {
                        debug!(qname = %ctx.qname, "serving stale cache entry, no server available");
                        self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                        ctx.packet = response;
                        return ProcessOutcome::Answer;
                    }
                }
            }
        }

        if self.runtime.settings.serv_fail_on_no_policy
            && self.synthesize_into(ctx, ResponseCode::ServFail)
        {
            return ProcessOutcome::Answer;
        }
        ProcessOutcome::Drop
    }

    fn effective_cache_key(&self, ctx: &QueryContext) -> CacheKey {
        // zero-scope pools share one entry across client subnets
        if ctx.use_zero_scope || !ctx.use_ecs {
            ctx.cache_key_no_ecs()
        } else {
            ctx.cache_key()
        }
    }

    fn apply_block_action(
        &self,
        ctx: &mut QueryContext,
        action: ActionKind,
    ) -> Option<ProcessOutcome> {
        let answer_or_drop = |ok: bool| {
            Some(if ok {
                ProcessOutcome::Answer
            } else {
                ProcessOutcome::Drop
            })
        };
        match action {
            ActionKind::Drop => Some(ProcessOutcome::Drop),
            ActionKind::Nxdomain => {
                answer_or_drop(self.synthesize_into(ctx, ResponseCode::NXDomain))
            }
            ActionKind::Refused => {
                answer_or_drop(self.synthesize_into(ctx, ResponseCode::Refused))
            }
            ActionKind::ServFail => {
                answer_or_drop(self.synthesize_into(ctx, ResponseCode::ServFail))
            }
            ActionKind::Truncate => {
                if ctx.tcp {
                    Some(ProcessOutcome::Drop)
                } else if question::set_truncated_response(&mut ctx.packet).is_ok() {
                    self.finish_self_answered(ctx);
                    Some(ProcessOutcome::Answer)
                } else {
                    Some(ProcessOutcome::Drop)
                }
            }
            ActionKind::NoRecurse => {
                let _ = question::clear_recursion_desired(&mut ctx.packet);
                None
            }
            ActionKind::NoOp => None,
        }
    }

    // ========================================================================
    // Rule walks
    // ========================================================================

    fn apply_query_rules(&self, ctx: &mut QueryContext) -> RuleWalk {
        let chain = self.runtime.query_rules.snapshot();
        for rule in chain.iter() {
            if !rule.matcher.matches(ctx) {
                continue;
            }
            rule.record_match();
            match &rule.action {
                Action::Drop => {
                    self.stats.rule_drop.fetch_add(1, Ordering::Relaxed);
                    return RuleWalk::Drop;
                }
                Action::Allow => return RuleWalk::Fall,
                Action::Nxdomain => {
                    self.stats.rule_nxdomain.fetch_add(1, Ordering::Relaxed);
                    return self.answer_with(ctx, ResponseCode::NXDomain);
                }
                Action::Refused => {
                    self.stats.rule_refused.fetch_add(1, Ordering::Relaxed);
                    return self.answer_with(ctx, ResponseCode::Refused);
                }
                Action::ServFail => {
                    self.stats.rule_servfail.fetch_add(1, Ordering::Relaxed);
                    return self.answer_with(ctx, ResponseCode::ServFail);
                }
                Action::Spoof(addrs) => {
                    return match crate::rules::action::synthesize_spoof(ctx, addrs) {
                        Ok(response) => {
                            ctx.packet = response;
                            self.finish_self_answered(ctx);
                            RuleWalk::Answer
                        }
                        Err(e) => {
                            warn!(error = %e, "spoof synthesis failed");
                            RuleWalk::Drop
                        }
                    };
                }
                Action::SpoofRaw(rdatas) => {
                    return match crate::rules::action::synthesize_spoof_raw(ctx, rdatas) {
                        Ok(response) => {
                            ctx.packet = response;
                            self.finish_self_answered(ctx);
                            RuleWalk::Answer
                        }
                        Err(e) => {
                            warn!(error = %e, "raw spoof synthesis failed");
                            RuleWalk::Drop
                        }
                    };
                }
                Action::Truncate => {
                    // meaningless on a stream transport, ignored there
                    if !ctx.tcp {
                        self.stats.rule_truncated.fetch_add(1, Ordering::Relaxed);
                        if question::set_truncated_response(&mut ctx.packet).is_ok() {
                            self.finish_self_answered(ctx);
                            return RuleWalk::Answer;
                        }
                        return RuleWalk::Drop;
                    }
                }
                Action::NoRecurse => {
                    let _ = question::clear_recursion_desired(&mut ctx.packet);
                }
                Action::HeaderModify(header_mod) => {
                    let _ = header_mod.apply(&mut ctx.packet);
                }
                Action::Pool(name) => {
                    ctx.pool_name.clone_from(name);
                }
                Action::Delay(ms) => {
                    ctx.delay_ms = *ms;
                }
                Action::NoOp => {}
            }
        }
        RuleWalk::Fall
    }

    fn answer_with(&self, ctx: &mut QueryContext, rcode: ResponseCode) -> RuleWalk {
        if self.synthesize_into(ctx, rcode) {
            RuleWalk::Answer
        } else {
            RuleWalk::Drop
        }
    }

    /// Synthesize an rcode-only response into the context and run the
    /// self-answered chain over it.
    fn synthesize_into(&self, ctx: &mut QueryContext, rcode: ResponseCode) -> bool {
        match crate::rules::action::synthesize_rcode(ctx, rcode) {
            Ok(response) => {
                ctx.packet = response;
                self.finish_self_answered(ctx)
            }
            Err(e) => {
                warn!(error = %e, "response synthesis failed");
                false
            }
        }
    }

    fn finish_self_answered(&self, ctx: &mut QueryContext) -> bool {
        self.stats.self_answered.fetch_add(1, Ordering::Relaxed);
        let chain = self.runtime.self_answered_rules.snapshot();
        self.apply_response_rules(&chain, ctx)
    }

    /// Walk a response rule chain over the packet in `ctx`. Returns
    /// `false` when the response must be discarded.
    fn apply_response_rules(&self, chain: &ResponseRuleChain, ctx: &mut QueryContext) -> bool {
        for rule in chain {
            if !rule.matcher.matches(ctx) {
                continue;
            }
            rule.record_match();
            match &rule.action {
                ResponseAction::Allow => return true,
                ResponseAction::Delay(ms) => ctx.delay_ms = *ms,
                ResponseAction::Drop => return false,
                ResponseAction::HeaderModify(header_mod) => {
                    let _ = header_mod.apply(&mut ctx.packet);
                }
                ResponseAction::ServFail => {
                    let _ = question::set_rcode_response(&mut ctx.packet, 2);
                }
                ResponseAction::None => {}
            }
        }
        true
    }

    // ========================================================================
    // Response path
    // ========================================================================

    /// Handle one datagram read from a backend socket.
    pub async fn handle_backend_response(&self, backend: &Arc<Backend>, data: &[u8]) {
        if data.len() < DNS_HEADER_SIZE || !question::is_response(data).unwrap_or(false) {
            self.stats
                .non_compliant_responses
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some((qname, qtype, qclass)) = parse_question(data) else {
            self.stats
                .non_compliant_responses
                .fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Ok(index) = question::dns_id(data) else {
            return;
        };

        match backend.slots.try_release(index, &qname, qtype, qclass) {
            Release::Owned(payload) => {
                backend.stats.responses.fetch_add(1, Ordering::Relaxed);
                let latency = payload.sent_time.udiff();
                backend.record_latency(latency);

                let mut response = BytesMut::from(data);
                if question::set_dns_id(&mut response, payload.orig_id).is_err() {
                    return;
                }
                self.deliver_response(&payload, response, latency).await;
            }
            Release::Mismatch => {
                // arrived for a slot now holding a different query
                self.stats
                    .non_compliant_responses
                    .fetch_add(1, Ordering::Relaxed);
            }
            Release::Lost => {
                trace!(backend = %backend.name_with_addr(), index, "response for a released slot, dropped");
            }
        }
    }

    async fn deliver_response(&self, payload: &SlotPayload, mut response: BytesMut, latency: f64) {
        // rebuild the query-shaped view the response rules match against
        let mut ctx = match response_context(payload, response.clone()) {
            Some(ctx) => ctx,
            None => return,
        };

        let chain = self.runtime.response_rules.snapshot();
        if !self.apply_response_rules(&chain, &mut ctx) {
            return;
        }
        response = ctx.packet;

        self.maybe_cache_insert(payload, &response);

        self.stats.responses.fetch_add(1, Ordering::Relaxed);
        payload.frontend.responses.fetch_add(1, Ordering::Relaxed);
        if question::rcode(&response).unwrap_or(0) == 2 {
            self.stats.servfail_responses.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.record_latency(latency as u64);

        if payload.muted {
            return;
        }
        let delay = Duration::from_millis(u64::from(ctx.delay_ms.max(payload.delay_ms)));
        let socket = Arc::clone(&payload.origin_socket);
        let client = payload.client;
        if delay.is_zero() {
            if let Err(e) = socket.send_to(&response, client).await {
                debug!(client = %client, error = %e, "reply send failed");
            }
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = socket.send_to(&response, client).await {
                    debug!(client = %client, error = %e, "delayed reply send failed");
                }
            });
        }
    }

    fn maybe_cache_insert(&self, payload: &SlotPayload, response: &[u8]) {
        let key = if payload.use_zero_scope {
            payload.cache_key_no_ecs.clone()
        } else {
            payload.cache_key.clone()
        };
        self.cache_response(
            &payload.pool_name,
            payload.skip_cache,
            key,
            payload.temp_failure_ttl,
            response,
        );
    }

    /// Insert a response into its pool's cache when eligible.
    ///
    /// NoError and NXDomain cache on the shortest record TTL; ServFail only
    /// under an explicit temporary-failure override; everything else is not
    /// cached. Both the datagram and the stream response paths end here.
    fn cache_response(
        &self,
        pool_name: &str,
        skip_cache: bool,
        key: Option<CacheKey>,
        temp_failure_ttl: Option<u32>,
        response: &[u8],
    ) {
        if skip_cache {
            return;
        }
        let Some(pool) = self.runtime.pool(pool_name) else {
            return;
        };
        let Some(cache) = pool.cache() else {
            return;
        };
        let Some(key) = key else {
            return;
        };

        let ttl = match question::rcode(response).unwrap_or(0) {
            0 | 3 => response_min_ttl(response)
                .ok()
                .flatten()
                .map(u64::from)
                .map(Duration::from_secs),
            2 => temp_failure_ttl.map(u64::from).map(Duration::from_secs),
            _ => None,
        };
        if let Some(ttl) = ttl {
            if !ttl.is_zero() {
                cache.insert(
                    key,
                    bytes::Bytes::copy_from_slice(response),
                    ttl,
                    Instant::now(),
                );
            }
        }
    }

    /// Resolve a stream client's query over a dedicated TCP exchange with
    /// the backend, leaving the validated response in the context.
    pub async fn forward_over_tcp(&self, backend: &Arc<Backend>, ctx: &mut QueryContext) -> bool {
        let response = match backend.query_tcp(&ctx.packet).await {
            Ok(response) => response,
            Err(e) => {
                self.stats
                    .downstream_send_errors
                    .fetch_add(1, Ordering::Relaxed);
                debug!(backend = %backend.name_with_addr(), error = %e, "stream exchange failed");
                return false;
            }
        };

        // the response must answer the question we asked
        let valid = parse_question(&response)
            .is_some_and(|(qname, qtype, qclass)| {
                qname == ctx.qname && qtype == ctx.qtype && qclass == ctx.qclass
            })
            && question::is_response(&response).unwrap_or(false)
            && question::dns_id(&response).ok() == ctx.id().ok();
        if !valid {
            self.stats
                .non_compliant_responses
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let latency = ctx.received_at.elapsed();
        backend.record_latency(latency.as_micros() as f64);

        ctx.packet = response;
        let chain = self.runtime.response_rules.snapshot();
        if !self.apply_response_rules(&chain, ctx) {
            return false;
        }

        // feed the pool cache exactly like the datagram path
        self.cache_response(
            &ctx.pool_name,
            ctx.skip_cache,
            Some(self.effective_cache_key(ctx)),
            ctx.temp_failure_ttl,
            &ctx.packet,
        );

        self.stats.responses.fetch_add(1, Ordering::Relaxed);
        if question::rcode(&ctx.packet).unwrap_or(0) == 2 {
            self.stats.servfail_responses.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.record_latency(latency.as_micros() as u64);
        true
    }
}

/// Parse the first question of a packet, lowercased.
fn parse_question(data: &[u8]) -> Option<(Name, RecordType, DNSClass)> {
    use hickory_proto::op::Message;
    use hickory_proto::serialize::binary::BinDecodable;

    let message = Message::from_bytes(data).ok()?;
    let query = message.queries().first()?;
    Some((
        query.name().to_lowercase(),
        query.query_type(),
        query.query_class(),
    ))
}

/// Rebuild a query-shaped context from an in-flight payload so response
/// rules can match on the same attributes as query rules.
fn response_context(payload: &SlotPayload, packet: BytesMut) -> Option<QueryContext> {
    let mut ctx = QueryContext::from_packet(
        packet,
        payload.dest,
        payload.client,
        false,
        payload.sent_time.anchor(),
    )
    .ok()?;
    ctx.hop_local = payload.hop_local;
    ctx.hop_remote = payload.hop_remote;
    ctx.pool_name.clone_from(&payload.pool_name);
    ctx.orig_flags = payload.orig_flags;
    ctx.dnssec_ok = payload.dnssec_ok;
    ctx.unique_id = payload.unique_id;
    Some(ctx)
}
