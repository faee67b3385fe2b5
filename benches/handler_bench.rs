//! Benchmarks for the query handler.
//!
//! Run with: cargo bench

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::Rng;
use tokio::runtime::Runtime;

use umleitung::ServerProperties;
use umleitung::dns::{DnsQuery, TYPE_A, encode_query};
use umleitung::forwarder::UpstreamForwarder;
use umleitung::handler::{PendingQuery, QueryHandler};
use umleitung::rules::{MasqHost, RuleTable};
use umleitung::transport::Protocol;

fn handler() -> QueryHandler {
    let rules = Arc::new(RuleTable::new());
    rules.upsert(MasqHost::new("evil.example.com", Some([127, 0, 0, 1].into()), None).unwrap());

    QueryHandler::new(
        rules,
        Arc::new(ArcSwap::from_pointee(ServerProperties::default())),
        Arc::new(UpstreamForwarder::new(Vec::new())),
    )
}

fn pending(query: Vec<u8>) -> PendingQuery {
    let client: SocketAddr = "127.0.0.1:12345".parse().unwrap();
    PendingQuery::new(client, query, Protocol::Udp, Duration::from_secs(5))
}

fn bench_query_parse(c: &mut Criterion) {
    let query = encode_query(0x1234, "subdomain.example.domain.com", TYPE_A);

    c.bench_function("parse_query", |b| b.iter(|| DnsQuery::parse(black_box(&query))));
}

fn bench_masqueraded_answer(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let handler = handler();

    c.bench_function("handle_masqueraded", |b| {
        b.to_async(&rt).iter(|| async {
            let id = rand::rng().random::<u16>();
            let handled = handler
                .handle(&pending(encode_query(id, "evil.example.com", TYPE_A)))
                .await;
            black_box(handled.response)
        })
    });
}

fn bench_rejected(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let handler = handler();
    let mut query = encode_query(0x1234, "evil.example.com", TYPE_A);
    query[5] = 2;

    c.bench_function("handle_format_error", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(handler.handle(&pending(query.clone())).await.response) })
    });
}

fn bench_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let handler = handler();
    let queries: Vec<Vec<u8>> = (0..1000u16)
        .map(|id| encode_query(id, "evil.example.com", TYPE_A))
        .collect();

    let mut group = c.benchmark_group("throughput");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("handle_1000_masqueraded", |b| {
        b.to_async(&rt).iter(|| async {
            for query in &queries {
                black_box(handler.handle(&pending(query.clone())).await);
            }
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_query_parse,
    bench_masqueraded_answer,
    bench_rejected,
    bench_throughput,
);

criterion_main!(benches);
