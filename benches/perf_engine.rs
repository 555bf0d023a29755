use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use elemental::core::graph::NewDependency;
use elemental::core::ids::{self, IdSeed};
use elemental::core::model::DependencyType;
use elemental::core::queries::ReadyFilter;
use elemental::core::store::Store;
use serde_json::Map;
use std::time::Duration;

/// Benchmark content-addressed ID derivation across hash lengths.
fn bench_id_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("id_derivation");
    let seed = IdSeed {
        identifier: "Benchmark the adaptive generator",
        created_by: "el-bench",
        timestamp_ns: 1_754_000_000_000_000_000,
    };
    for length in [3usize, 5, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, &len| {
            b.iter(|| black_box(ids::derive(&seed, 0, len)));
        });
    }
    group.finish();
}

/// Benchmark element creation throughput against an in-memory store.
fn bench_element_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("element_create");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("create_task", |b| {
        let store = Store::open_in_memory().unwrap();
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            black_box(store.create_task(&format!("bench task {n}"), "el-bench").unwrap());
        });
    });
    group.finish();
}

/// Benchmark cycle checking on a blocks chain of increasing depth.
fn bench_cycle_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle_check");
    for chain_len in [10usize, 100] {
        group.bench_with_input(
            BenchmarkId::from_parameter(chain_len),
            &chain_len,
            |b, &chain_len| {
                let store = Store::open_in_memory().unwrap();
                let mut ids = Vec::with_capacity(chain_len);
                for n in 0..chain_len {
                    ids.push(
                        store
                            .create_task(&format!("chain {n}"), "el-bench")
                            .unwrap()
                            .id
                            .into_string(),
                    );
                }
                for pair in ids.windows(2) {
                    store
                        .add_dependency(NewDependency {
                            source_id: pair[0].clone(),
                            target_id: pair[1].clone(),
                            dep_type: DependencyType::Blocks,
                            created_by: "el-bench".to_string(),
                            metadata: Map::new(),
                        })
                        .unwrap();
                }
                b.iter(|| black_box(store.has_cycle(DependencyType::Blocks).unwrap()));
            },
        );
    }
    group.finish();
}

/// Benchmark the readiness query over a store with blocked and free tasks.
fn bench_ready_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("ready_query");
    group.measurement_time(Duration::from_secs(10));

    let store = Store::open_in_memory().unwrap();
    let mut previous: Option<String> = None;
    for n in 0..200 {
        let id = store
            .create_task(&format!("ready bench {n}"), "el-bench")
            .unwrap()
            .id
            .into_string();
        if n % 2 == 0 {
            if let Some(prev) = &previous {
                store
                    .add_dependency(NewDependency {
                        source_id: id.clone(),
                        target_id: prev.clone(),
                        dep_type: DependencyType::Blocks,
                        created_by: "el-bench".to_string(),
                        metadata: Map::new(),
                    })
                    .unwrap();
            }
        }
        previous = Some(id);
    }

    group.bench_function("ready_200_tasks", |b| {
        b.iter(|| black_box(store.ready(&ReadyFilter::default()).unwrap()));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_id_derivation,
    bench_element_create,
    bench_cycle_check,
    bench_ready_query
);
criterion_main!(benches);
