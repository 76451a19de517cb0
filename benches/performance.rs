//! Performance benchmarks for netsecops

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use netsecops::{
    audit::NullAuditSink,
    config::DiscoveryConfig,
    intelligence::{
        classify_device, os_fingerprinting::guess_from_ports,
        service_detection::parse_service_output, DeviceEvidence, VendorDatabase,
    },
    network::{HostProbe, HostResult},
    utils::{expand, parse_ports},
    DiscoveryCoordinator,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Benchmark target and port specification parsing
fn bench_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("parsing");

    for spec in ["10.0.0.0/24", "10.0.0.1-254", "10.0.0.1,10.0.0.5-9;10.0.1.0/28 10.0.2.7"] {
        group.bench_with_input(BenchmarkId::new("expand", spec), spec, |b, spec| {
            b.iter(|| black_box(expand(black_box(spec))))
        });
    }

    group.bench_function("parse_ports_mixed", |b| {
        b.iter(|| black_box(parse_ports(black_box("1-1024,3306,3389,5432,8000-8100,65535"))))
    });

    group.finish();
}

/// Benchmark the classification tables
fn bench_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("classification");
    let vendors = VendorDatabase::builtin();

    group.bench_function("vendor_lookup", |b| {
        b.iter(|| black_box(vendors.lookup(black_box("00:50:56:c0:00:08"))))
    });

    group.bench_function("os_from_ports", |b| {
        b.iter(|| black_box(guess_from_ports(black_box(&[135, 139, 445, 3389]))))
    });

    group.bench_function("device_type", |b| {
        let ports = [22, 80, 443, 9100];
        b.iter(|| {
            black_box(classify_device(&DeviceEvidence {
                ip: Ipv4Addr::new(192, 168, 1, 40),
                open_ports: black_box(&ports),
                vendor: "HP",
            }))
        })
    });

    let nmap = "PORT     STATE SERVICE VERSION\n\
                22/tcp   open  ssh     OpenSSH 8.9p1 Ubuntu\n\
                80/tcp   open  http    nginx 1.18.0\n\
                443/tcp  open  https\n";
    group.bench_function("nmap_service_parse", |b| {
        b.iter(|| black_box(parse_service_output(black_box(nmap))))
    });

    group.finish();
}

struct InstantProbe;

#[async_trait]
impl HostProbe for InstantProbe {
    async fn probe(&self, host: Ipv4Addr, ports: &[u16]) -> HostResult {
        let mut result = HostResult::offline(host);
        result.is_online = host.octets()[3] % 3 == 0;
        if result.is_online {
            result.open_ports = ports.to_vec();
        }
        result
    }
}

/// Benchmark batch engine overhead with a probe that never waits
fn bench_discovery_batch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("discovery_batch");
    group.measurement_time(Duration::from_secs(10));

    for workers in [1usize, 10, 50] {
        group.bench_with_input(BenchmarkId::new("slash24", workers), &workers, |b, &workers| {
            b.iter(|| {
                rt.block_on(async {
                    let config = DiscoveryConfig::default()
                        .with_progress_interval(Duration::from_millis(50));
                    let coordinator = DiscoveryCoordinator::new(
                        Arc::new(InstantProbe),
                        config,
                        Arc::new(NullAuditSink),
                    );
                    coordinator.start("10.0.0.0/24", "22,80,443", workers).await.unwrap();
                    black_box(coordinator.wait().await)
                })
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parsing, bench_classification, bench_discovery_batch);
criterion_main!(benches);
