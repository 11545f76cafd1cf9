use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tasker_engine::concurrency::Semaphore;
use tasker_engine::config::EngineConfig;
use tasker_engine::models::Priority;
use tasker_engine::partition::PartitionManager;

fn benchmark_config_creation(c: &mut Criterion) {
    c.bench_function("config_creation", |b| b.iter(EngineConfig::default));
}

fn benchmark_partition_selection(c: &mut Criterion) {
    let manager = PartitionManager::from_config(&EngineConfig::default());
    let mut n = 0u64;
    c.bench_function("partition_select_and_release", |b| {
        b.iter(|| {
            n += 1;
            let slot = manager
                .select_partition(&format!("bench-{n}"), black_box(Priority::Normal))
                .expect("partitions have capacity");
            slot.release();
        })
    });
}

fn benchmark_semaphore_try_acquire(c: &mut Criterion) {
    let semaphore = Semaphore::new("bench", 64);
    c.bench_function("semaphore_try_acquire", |b| {
        b.iter(|| {
            let permit = semaphore.try_acquire().expect("permit available");
            drop(black_box(permit));
        })
    });
}

criterion_group!(
    benches,
    benchmark_config_creation,
    benchmark_partition_selection,
    benchmark_semaphore_try_acquire
);
criterion_main!(benches);
