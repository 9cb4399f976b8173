//! Performance benchmarks for server selection and rule matching.
//!
//! Run with: `cargo bench`
//!
//! Performance targets:
//! - Policy selection: <2us over a 16-backend pool
//! - Suffix block lookup: <1us with 10k entries
//! - Token bucket check: <100ns

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::BinEncodable;

use dnslb::backend::{Backend, BackendConfig};
use dnslb::dynblock::{DynBlock, SuffixBlockTable};
use dnslb::limiter::QpsLimiter;
use dnslb::policy::LbPolicy;
use dnslb::pool::NumberedServer;
use dnslb::question::QueryContext;

// ============================================================================
// Helper Functions
// ============================================================================

/// Build a pool snapshot with the specified number of up backends.
fn build_servers(count: usize) -> Vec<NumberedServer> {
    (0..count)
        .map(|i| {
            let config = BackendConfig::new(
                format!("backend{i}"),
                format!("127.0.0.1:{}", 5300 + i).parse().unwrap(),
            )
            .with_weight(4)
            .with_order(i as u32 + 1);
            let server = Backend::new(config);
            server.health.set_up();
            NumberedServer {
                position: i as u32 + 1,
                server,
            }
        })
        .collect()
}

fn build_context(qname: &str) -> QueryContext {
    let mut message = Message::new();
    message.set_id(0x1234);
    message.set_message_type(MessageType::Query);
    message.add_query(Query::query(Name::from_str(qname).unwrap(), RecordType::A));
    let packet = bytes::BytesMut::from(&message.to_bytes().unwrap()[..]);
    QueryContext::from_packet(
        packet,
        "127.0.0.1:53".parse().unwrap(),
        "10.0.0.1:4242".parse().unwrap(),
        false,
        Instant::now(),
    )
    .unwrap()
}

fn build_suffix_table(entries: usize) -> SuffixBlockTable {
    let mut table = SuffixBlockTable::new();
    let until = Instant::now() + std::time::Duration::from_secs(3600);
    for i in 0..entries {
        table.insert(&format!("blocked{i}.test"), DynBlock::new("bench", until));
    }
    table
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_policies(c: &mut Criterion) {
    let servers = build_servers(16);
    let ctx = build_context("www.example.com.");

    let mut group = c.benchmark_group("policy_select");
    for policy in [
        LbPolicy::FirstAvailable,
        LbPolicy::RoundRobin,
        LbPolicy::LeastOutstanding,
        LbPolicy::Whashed,
        LbPolicy::Chashed,
        LbPolicy::Random,
    ] {
        group.bench_with_input(
            BenchmarkId::from_parameter(policy.name()),
            &policy,
            |b, policy| {
                b.iter(|| black_box(policy.select(black_box(&servers), black_box(&ctx))));
            },
        );
    }
    group.finish();
}

fn bench_suffix_blocks(c: &mut Criterion) {
    let table = build_suffix_table(10_000);
    let now = Instant::now();

    let mut group = c.benchmark_group("suffix_block");
    group.bench_function("hit", |b| {
        b.iter(|| black_box(table.lookup(black_box("www.blocked42.test."), now)));
    });
    group.bench_function("miss", |b| {
        b.iter(|| black_box(table.lookup(black_box("www.unblocked.example."), now)));
    });
    group.finish();
}

fn bench_limiter(c: &mut Criterion) {
    let limiter = Arc::new(QpsLimiter::new(1_000_000, 1_000_000));
    c.bench_function("limiter_check", |b| {
        b.iter(|| black_box(limiter.check()));
    });
}

criterion_group!(benches, bench_policies, bench_suffix_blocks, bench_limiter);
criterion_main!(benches);
