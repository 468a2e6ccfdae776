//! Performance benchmarks for telemetry dispatch
//!
//! Run with: cargo bench --features benchmarks

#[cfg(feature = "benchmarks")]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(feature = "benchmarks")]
use std::sync::Arc;
#[cfg(feature = "benchmarks")]
use tlmserver::channel::{Channel, Subscriber, TelemetryUpdate};
#[cfg(feature = "benchmarks")]
use tlmserver::codec::TelemetryCodec;
#[cfg(feature = "benchmarks")]
use tlmserver::mission::{build_packet, MissionDb};
#[cfg(feature = "benchmarks")]
use tlmserver::receiver::ReceiveContext;
#[cfg(feature = "benchmarks")]
use tlmserver::{ChannelRegistry, RoutingKey};

#[cfg(feature = "benchmarks")]
const DB: &str = r#"
mission = "bench"
target = "cpu1"

[[message]]
topic = "CFE_ES/Application/HousekeepingTlm"
topic_id = 88
fields = [
    { name = "CommandCounter", type = "u8" },
    { name = "CommandErrorCounter", type = "u8" },
    { name = "CheckSum", type = "u16" },
    { name = "Version", type = "u8", count = 4 },
    { name = "Uptime", type = "u32" },
    { name = "Temperature", type = "f32" },
]
"#;

#[cfg(feature = "benchmarks")]
struct Sink;

#[cfg(feature = "benchmarks")]
impl Subscriber for Sink {
    fn update(&self, _: &Channel, update: &TelemetryUpdate) -> anyhow::Result<()> {
        black_box(update.message.primary.sequence_count);
        Ok(())
    }
}

#[cfg(feature = "benchmarks")]
fn packet() -> Vec<u8> {
    build_packet(91, 1, 1000, &[0u8; 16])
}

#[cfg(feature = "benchmarks")]
fn benchmark_decode(c: &mut Criterion) {
    let db = MissionDb::parse(DB).unwrap_or_else(|e| panic!("bench db: {:#}", e));
    let packet = packet();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(packet.len() as u64));
    group.bench_function("es_housekeeping", |b| {
        b.iter(|| black_box(db.decode(black_box(&packet)).is_ok()));
    });
    group.finish();
}

#[cfg(feature = "benchmarks")]
fn benchmark_registry_lookup(c: &mut Criterion) {
    let topics = (0..500u16)
        .map(|i| (format!("APP{}/Application/Tlm", i), i * 2))
        .collect();
    let registry = ChannelRegistry::build(topics);

    let mut group = c.benchmark_group("registry");
    group.bench_function("lookup_hit", |b| {
        b.iter(|| black_box(registry.lookup(black_box(RoutingKey(503)))));
    });
    group.bench_function("lookup_miss", |b| {
        b.iter(|| black_box(registry.lookup(black_box(RoutingKey(504)))));
    });
    group.finish();
}

#[cfg(feature = "benchmarks")]
fn benchmark_dispatch(c: &mut Criterion) {
    let db = Arc::new(MissionDb::parse(DB).unwrap_or_else(|e| panic!("bench db: {:#}", e)));
    let registry = Arc::new(ChannelRegistry::build(db.topic_map()));
    let from = "127.0.0.1:1235"
        .parse()
        .unwrap_or_else(|e| panic!("addr: {}", e));
    let packet = packet();

    let mut group = c.benchmark_group("dispatch");
    for subscribers in [1usize, 8, 32] {
        let ctx = ReceiveContext::new(registry.clone(), db.clone());
        if let Some(channel) = registry.lookup(RoutingKey(91)) {
            while channel.subscriber_count() < subscribers {
                channel.attach(Arc::new(Sink));
            }
        }
        group.bench_function(format!("handle_datagram_{}_subscribers", subscribers), |b| {
            b.iter(|| black_box(ctx.handle_datagram(black_box(&packet), from)));
        });
    }
    group.finish();
}

#[cfg(feature = "benchmarks")]
criterion_group!(
    benches,
    benchmark_decode,
    benchmark_registry_lookup,
    benchmark_dispatch
);

#[cfg(feature = "benchmarks")]
criterion_main!(benches);

#[cfg(not(feature = "benchmarks"))]
fn main() {
    println!("Benchmarks are disabled. Enable with:");
    println!("  cargo bench --features benchmarks");
}
