//! Benchmarks for blacklist lookup.
//!
//! Measures how quickly a query can be classified against a full-size list.

use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box};

use blackhole_dnsd::dns::extract_domain_names;
use blackhole_dnsd::filter::{Blacklist, filter_query};
use blackhole_dnsd::http;
use blackhole_dnsd::ratelimit::RateLimit;

fn create_dns_query(query_id: u16, domain: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(512);
    packet.extend_from_slice(&query_id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    for label in domain.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00);
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    packet
}

/// A list about the size of the two default sources combined.
fn full_blacklist() -> Blacklist {
    let client = http::client().expect("HTTP client");
    let blacklist = Blacklist::new(client, Vec::new());
    blacklist.replace(
        (0..20_000)
            .map(|i| format!("ads{i}.tracker.net"))
            .chain(["doubleclick.com".to_string()]),
    );
    blacklist
}

fn bench_contains(c: &mut Criterion) {
    let blacklist = full_blacklist();

    let mut group = c.benchmark_group("blacklist");
    group.throughput(Throughput::Elements(1));

    for domain in [
        "doubleclick.com",
        "ads.tracking.doubleclick.com",
        "www.google.com",
        "a.b.c.d.e.f.example.org",
    ] {
        let names = extract_domain_names(&create_dns_query(0x1234, domain));
        group.bench_with_input(BenchmarkId::new("contains", domain), &names, |b, names| {
            b.iter(|| blacklist.contains(black_box(names.as_slice())))
        });
    }

    let query = create_dns_query(0x1234, "ads.tracking.doubleclick.com");
    group.bench_function("filter_query", |b| {
        b.iter(|| filter_query(&blacklist, black_box(&query)))
    });

    group.finish();
}

fn bench_rate_limit(c: &mut Criterion) {
    let limiter = RateLimit::new(Duration::from_secs(10), u32::MAX);
    let clients: Vec<String> = (0..256).map(|i| format!("192.168.1.{i}")).collect();

    let mut group = c.benchmark_group("rate_limit");
    group.throughput(Throughput::Elements(clients.len() as u64));
    group.bench_function("add_256_clients", |b| {
        b.iter(|| {
            for client in &clients {
                black_box(limiter.add(client));
            }
        })
    });
    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_contains(&mut criterion);
    bench_rate_limit(&mut criterion);
    criterion.final_summary();
}
