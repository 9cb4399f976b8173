//! End-to-end scenarios for the query life-cycle engine.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::str::FromStr;

use dnslb::backend::{Backend, BackendConfig};
use dnslb::cache::{CacheTuning, MokaPacketCache, PacketCache};
use dnslb::dynblock::DynBlock;
use dnslb::engine::{ProcessOutcome, QueryEngine};
use dnslb::metrics::EngineStats;
use dnslb::policy::LbPolicy;
use dnslb::pool::ServerPool;
use dnslb::question::QueryContext;
use dnslb::rules::{HeaderMod, ResponseAction, ResponseRuleAction, RuleMatcher};
use dnslb::runtime::{EngineSettings, Runtime};
use dnslb::NetmaskGroup;

fn query_packet(qname: &str, qtype: RecordType, id: u16) -> BytesMut {
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(qname).unwrap(), qtype));
    BytesMut::from(&message.to_bytes().unwrap()[..])
}

fn context(qname: &str, qtype: RecordType, client: &str) -> QueryContext {
    QueryContext::from_packet(
        query_packet(qname, qtype, 0x1234),
        "127.0.0.1:53".parse().unwrap(),
        client.parse().unwrap(),
        false,
        Instant::now(),
    )
    .unwrap()
}

fn response_packet(qname: &str, id: u16, addr: [u8; 4], ad_bit: bool) -> Bytes {
    let name = Name::from_str(qname).unwrap();
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Response);
    message.set_response_code(ResponseCode::NoError);
    message.set_recursion_desired(true);
    message.set_recursion_available(true);
    message.set_authentic_data(ad_bit);
    message.add_query(Query::query(name.clone(), RecordType::A));
    let mut record = Record::new();
    record.set_name(name);
    record.set_record_type(RecordType::A);
    record.set_ttl(300);
    record.set_data(Some(RData::A(A(addr.into()))));
    message.add_answer(record);
    Bytes::from(message.to_bytes().unwrap())
}

fn up_backend(name: &str, port: u16) -> Arc<Backend> {
    let config = BackendConfig::new(name, format!("127.0.0.1:{port}").parse().unwrap());
    let backend = Backend::new(config);
    backend.health.set_up();
    backend
}

fn engine_with(runtime: &Arc<Runtime>) -> QueryEngine {
    QueryEngine::new(Arc::clone(runtime), Arc::new(EngineStats::new()))
}

// ============================================================================
// S1: ACL deny
// ============================================================================

#[tokio::test]
async fn acl_denied_client_is_dropped_without_backend_traffic() {
    let runtime = Runtime::new(EngineSettings::default());
    runtime
        .acl
        .publish(NetmaskGroup::from_masks(["192.0.2.0/24"]).unwrap());
    let backend = up_backend("b1", 5300);
    runtime.register_server(Arc::clone(&backend), &[]);
    let engine = engine_with(&runtime);

    let mut ctx = context("example.com.", RecordType::A, "10.0.0.5:4242");
    let outcome = engine.process_query(&mut ctx);

    assert!(matches!(outcome, ProcessOutcome::Drop));
    assert_eq!(engine.stats().snapshot().acl_drops, 1);
    assert_eq!(backend.stats.queries.load(Ordering::Relaxed), 0);
}

// ============================================================================
// S2: round-robin fan-out
// ============================================================================

#[tokio::test]
async fn round_robin_alternates_between_up_backends() {
    let runtime = Runtime::new(EngineSettings::default());
    runtime.policy.publish(LbPolicy::RoundRobin);
    runtime.register_server(up_backend("b1", 5301), &[]);
    runtime.register_server(up_backend("b2", 5302), &[]);
    let engine = engine_with(&runtime);

    let mut recipients = Vec::new();
    for _ in 0..4 {
        let mut ctx = context("example.com.", RecordType::A, "127.0.0.1:4242");
        match engine.process_query(&mut ctx) {
            ProcessOutcome::Forward(backend) => recipients.push(backend.name().to_string()),
            other => panic!("expected a forward, got {other:?}"),
        }
    }

    // the cursor is shared process state, so assert the alternation shape
    assert_ne!(recipients[0], recipients[1]);
    assert_eq!(recipients[0], recipients[2]);
    assert_eq!(recipients[1], recipients[3]);
}

// ============================================================================
// S3: slot reuse defeats a stale response
// ============================================================================

#[tokio::test]
async fn reused_slot_rejects_the_previous_occupants_response() {
    use dnslb::backend::{Release, SlotPayload, SlotTable};
    use dnslb::frontend::FrontendStats;
    use hickory_proto::rr::DNSClass;

    let table = SlotTable::new(1);
    let socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let stats = Arc::new(FrontendStats::default());

    let q1 = context("first.test.", RecordType::A, "10.0.0.1:1000");
    let claimed = table.claim(SlotPayload::from_query(
        &q1,
        Arc::clone(&socket),
        Arc::clone(&stats),
        false,
        None,
        None,
    ));
    assert!(!claimed.reused);

    // the slot is reused for a different query before q1's answer arrives
    let q2 = context("second.test.", RecordType::A, "10.0.0.2:1000");
    let reclaimed = table.claim(SlotPayload::from_query(
        &q2,
        Arc::clone(&socket),
        Arc::clone(&stats),
        false,
        None,
        None,
    ));
    assert!(reclaimed.reused);
    assert_eq!(table.outstanding(), 1);

    // q1's late answer no longer matches the slot content and is discarded
    let q1_name = Name::from_str("first.test.").unwrap();
    let release = table.try_release(claimed.index, &q1_name, RecordType::A, DNSClass::IN);
    assert!(matches!(release, Release::Mismatch));
    assert_eq!(table.outstanding(), 1);

    // the fresh occupant is still releasable
    let q2_name = Name::from_str("second.test.").unwrap();
    let release = table.try_release(reclaimed.index, &q2_name, RecordType::A, DNSClass::IN);
    assert!(matches!(release, Release::Owned(_)));
}

// ============================================================================
// S4: backend rate limit
// ============================================================================

#[tokio::test]
async fn rate_limited_backend_falls_through_to_the_next_one() {
    let runtime = Runtime::new(EngineSettings::default());
    runtime.policy.publish(LbPolicy::FirstAvailable);

    let limited = Backend::new(
        BackendConfig::new("limited", "127.0.0.1:5303".parse().unwrap())
            .with_qps(10, 10)
            .with_order(1),
    );
    limited.health.set_up();
    let fallback = Backend::new(
        BackendConfig::new("fallback", "127.0.0.1:5304".parse().unwrap()).with_order(2),
    );
    fallback.health.set_up();
    runtime.register_server(Arc::clone(&limited), &[]);
    runtime.register_server(Arc::clone(&fallback), &[]);
    let engine = engine_with(&runtime);

    let mut first_hits = 0;
    let mut fallback_hits = 0;
    for _ in 0..15 {
        let mut ctx = context("example.com.", RecordType::A, "127.0.0.1:4242");
        match engine.process_query(&mut ctx) {
            ProcessOutcome::Forward(backend) if backend.name() == "limited" => first_hits += 1,
            ProcessOutcome::Forward(_) => fallback_hits += 1,
            other => panic!("expected a forward, got {other:?}"),
        }
    }

    assert_eq!(first_hits, 10, "the burst goes to the preferred backend");
    assert_eq!(fallback_hits, 5, "the excess falls through");
}

#[tokio::test]
async fn rate_limited_single_backend_drops_the_excess() {
    let runtime = Runtime::new(EngineSettings::default());
    let limited = Backend::new(
        BackendConfig::new("only", "127.0.0.1:5305".parse().unwrap()).with_qps(10, 10),
    );
    limited.health.set_up();
    runtime.register_server(limited, &[]);
    let engine = engine_with(&runtime);

    let mut forwarded = 0;
    let mut dropped = 0;
    for _ in 0..15 {
        let mut ctx = context("example.com.", RecordType::A, "127.0.0.1:4242");
        match engine.process_query(&mut ctx) {
            ProcessOutcome::Forward(_) => forwarded += 1,
            ProcessOutcome::Drop => dropped += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(forwarded, 10);
    assert_eq!(dropped, 5);
    assert_eq!(engine.stats().snapshot().no_policy, 5);
}

// ============================================================================
// S5: dynamic suffix block
// ============================================================================

#[tokio::test]
async fn dynamic_suffix_block_drops_matching_queries() {
    let runtime = Runtime::new(EngineSettings::default());
    runtime.register_server(up_backend("b1", 5306), &[]);
    runtime.dyn_block_suffixes.modify(|table| {
        table.insert(
            "evil.test",
            DynBlock::new("abuse", Instant::now() + Duration::from_secs(60)),
        );
    });
    let engine = engine_with(&runtime);

    let mut ctx = context("www.evil.test.", RecordType::A, "127.0.0.1:4242");
    let outcome = engine.process_query(&mut ctx);
    assert!(matches!(outcome, ProcessOutcome::Drop));
    assert_eq!(engine.stats().snapshot().dyn_blocked, 1);

    // unrelated names still flow
    let mut ctx = context("good.test.", RecordType::A, "127.0.0.1:4242");
    assert!(matches!(
        engine.process_query(&mut ctx),
        ProcessOutcome::Forward(_)
    ));
}

// ============================================================================
// S6: cache hit runs the cache-hit response chain
// ============================================================================

#[tokio::test]
async fn cache_hit_applies_cache_hit_response_rules() {
    let runtime = Runtime::new(EngineSettings::default());
    let cache: Arc<dyn PacketCache> = Arc::new(MokaPacketCache::new(CacheTuning::default()));
    let pool = Arc::new(ServerPool::with_cache(Arc::clone(&cache)));
    runtime.install_pool(dnslb::DEFAULT_POOL, Arc::clone(&pool));
    let backend = up_backend("b1", 5307);
    runtime.register_server(Arc::clone(&backend), &[]);

    runtime.cache_hit_rules.publish(vec![ResponseRuleAction::new(
        "clear-ad-on-a",
        RuleMatcher::QTypeIs(RecordType::A),
        ResponseAction::HeaderModify(HeaderMod::ClearAd),
    )]);
    let engine = engine_with(&runtime);

    // the first query misses the cache and goes to the backend
    let mut first = context("cached.example.com.", RecordType::A, "127.0.0.1:4242");
    assert!(matches!(
        engine.process_query(&mut first),
        ProcessOutcome::Forward(_)
    ));
    assert_eq!(engine.stats().snapshot().cache_misses, 1);

    // the backend's answer lands in the cache (inserted as the response
    // path would, AD bit set)
    cache.insert(
        first.cache_key_no_ecs(),
        response_packet("cached.example.com.", 0, [192, 0, 2, 7], true),
        Duration::from_secs(300),
        Instant::now(),
    );

    // the second identical query is answered from the cache with AD cleared
    let mut second = context("cached.example.com.", RecordType::A, "127.0.0.1:4242");
    let outcome = engine.process_query(&mut second);
    assert!(matches!(outcome, ProcessOutcome::Answer));
    assert_eq!(engine.stats().snapshot().cache_hits, 1);

    let message = Message::from_bytes(&second.packet).unwrap();
    assert_eq!(message.id(), 0x1234, "client id restored");
    assert!(!message.authentic_data(), "AD cleared by the cache-hit rule");
    assert_eq!(message.answers().len(), 1);
}

// ============================================================================
// Full UDP round trip through a mock resolver
// ============================================================================

async fn spawn_mock_resolver() -> SocketAddr {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(query) = Message::from_bytes(&buf[..n]) else {
                continue;
            };
            let Some(question) = query.queries().first().cloned() else {
                continue;
            };
            let mut response = Message::new();
            response.set_id(query.id());
            response.set_message_type(MessageType::Response);
            response.set_response_code(ResponseCode::NoError);
            response.set_recursion_available(true);
            response.add_query(question.clone());
            let mut record = Record::new();
            record.set_name(question.name().clone());
            record.set_record_type(question.query_type());
            record.set_ttl(60);
            record.set_data(Some(RData::A(A([192, 0, 2, 99].into()))));
            response.add_answer(record);
            let bytes = response.to_bytes().unwrap();
            let _ = socket.send_to(&bytes, peer).await;
        }
    });
    addr
}

#[tokio::test]
async fn udp_round_trip_through_frontend_and_backend() {
    use dnslb::backend::server::spawn_responders;
    use dnslb::frontend::{Frontend, FrontendKind, UdpFrontend};

    let resolver_addr = spawn_mock_resolver().await;

    let runtime = Runtime::new(EngineSettings::default());
    let backend = Backend::new(BackendConfig::new("mock", resolver_addr));
    backend.health.set_up();
    backend.connect().unwrap();
    runtime.register_server(Arc::clone(&backend), &[]);

    let stats = Arc::new(EngineStats::new());
    let engine = QueryEngine::new(Arc::clone(&runtime), Arc::clone(&stats));
    spawn_responders(&backend, &engine);

    let frontend = Frontend::new("127.0.0.1:0".parse().unwrap(), FrontendKind::Udp);
    let udp = Arc::new(UdpFrontend::bind(frontend, engine.clone()).await.unwrap());
    let listen_addr = udp.local_addr().unwrap();
    {
        let udp = Arc::clone(&udp);
        tokio::spawn(async move { udp.run().await });
    }

    // a plain stub client
    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(listen_addr).await.unwrap();
    let query = query_packet("roundtrip.example.com.", RecordType::A, 0x77aa);
    client.send(&query).await.unwrap();

    let mut buf = [0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
        .await
        .expect("response before timeout")
        .unwrap();

    let response = Message::from_bytes(&buf[..n]).unwrap();
    assert_eq!(response.id(), 0x77aa, "client transaction id restored");
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);
    assert_eq!(
        response.queries()[0].name().to_string(),
        "roundtrip.example.com."
    );

    assert_eq!(backend.stats.queries.load(Ordering::Relaxed), 1);
    assert_eq!(backend.stats.responses.load(Ordering::Relaxed), 1);
    assert_eq!(backend.outstanding(), 0, "slot released by the responder");
    assert_eq!(stats.snapshot().responses, 1);
}
