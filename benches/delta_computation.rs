//! Benchmarks for delta computation and session fan-out
//!
//! Measures:
//! - First-packet and steady-state delta computation for the HK fixture
//! - Full broadcast cost as the number of connected sessions grows
//!
//! Platform: Cross-platform (synthetic fixtures, CI-safe)

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use telemux::test_utils::{HK_UID, HkFrame, fixture_definitions};
use telemux::{Definitions, DeltaEngine, SessionRegistry};

fn bench_delta_engine(c: &mut Criterion) {
    let definitions = fixture_definitions();
    let hk = definitions.packet(HK_UID).expect("HK fixture");
    let frames: Vec<Vec<u8>> =
        (0..64u16).map(|i| HkFrame::default().voltages(i, 64 - i).mode((i % 3) as u8).temp(i as i16).bytes()).collect();

    let mut group = c.benchmark_group("delta_engine");
    group.throughput(Throughput::Elements(1));

    group.bench_function("first_packet", |b| {
        b.iter(|| {
            let engine = DeltaEngine::new(definitions.clone());
            black_box(engine.compute(&hk, black_box(&frames[0])).expect("decodes"))
        });
    });

    let engine = DeltaEngine::new(definitions.clone());
    engine.compute(&hk, &frames[0]).expect("decodes");
    let mut i = 0;
    group.bench_function("steady_state", |b| {
        b.iter(|| {
            i = (i + 1) % frames.len();
            black_box(engine.compute(&hk, black_box(&frames[i])).expect("decodes"))
        });
    });

    group.finish();
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_telemetry");
    let data: Arc<[u8]> = HkFrame::default().voltages(10, 20).bytes().into();

    for sessions in [1usize, 10, 100] {
        let registry = SessionRegistry::new(fixture_definitions());
        for _ in 0..sessions {
            registry.create_session();
        }

        group.throughput(Throughput::Elements(sessions as u64));
        group.bench_with_input(BenchmarkId::from_parameter(sessions), &sessions, |b, _| {
            b.iter(|| black_box(registry.broadcast_telemetry(HK_UID, Arc::clone(&data)).expect("broadcasts")));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_delta_engine, bench_broadcast);
criterion_main!(benches);
