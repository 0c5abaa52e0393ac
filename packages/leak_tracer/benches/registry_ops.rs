//! Benchmarks for the hot paths behind every tracked allocation and release.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use leak_tracer::{
    AllocationKind, AllocationRecord, CallStack, Libc, NodePool, Registry, Timestamp, Tracer,
};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const PREFILLED: usize = 10_000;

fn record(size: usize) -> AllocationRecord {
    AllocationRecord::new(size, AllocationKind::Scalar, Timestamp::ZERO, CallStack::EMPTY)
}

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("insert_remove_empty", |b| {
        let mut registry = Registry::new(Libc);

        b.iter(|| {
            _ = registry.insert(black_box(0x1000), record(64));
            black_box(registry.remove(black_box(0x1000)));
        });
    });

    group.bench_function("insert_remove_prefilled", |b| {
        let mut registry = Registry::new(Libc);

        for index in 0..PREFILLED {
            _ = registry.insert(0x10_0000 + index * 32, record(32));
        }

        b.iter(|| {
            _ = registry.insert(black_box(0x1000), record(64));
            black_box(registry.remove(black_box(0x1000)));
        });
    });

    group.bench_function("find_prefilled", |b| {
        let mut registry = Registry::new(Libc);

        for index in 0..PREFILLED {
            _ = registry.insert(0x10_0000 + index * 32, record(32));
        }

        b.iter(|| black_box(registry.find(black_box(0x10_0000 + 5000 * 32))));
    });

    group.finish();

    let mut group = c.benchmark_group("pool");

    group.bench_function("allocate_release", |b| {
        let pool = NodePool::<[usize; 8], _>::new(Libc);

        b.iter(|| {
            let node = pool.allocate().unwrap();

            // SAFETY: The node came from this pool and is released once.
            unsafe {
                pool.release(black_box(node));
            }
        });
    });

    group.finish();

    let mut group = c.benchmark_group("tracer");

    group.bench_function("allocate_release_idle", |b| {
        let tracer = Tracer::new(Libc);

        b.iter(|| {
            let block = tracer.allocate(black_box(64), AllocationKind::Scalar);

            // SAFETY: The block came from this tracer.
            unsafe {
                tracer.release(block, AllocationKind::Scalar);
            }
        });
    });

    group.bench_function("allocate_release_monitored", |b| {
        let tracer = Tracer::new(Libc);
        tracer.start_monitoring_all_threads();

        b.iter(|| {
            let block = tracer.allocate(black_box(64), AllocationKind::Scalar);

            // SAFETY: The block came from this tracer.
            unsafe {
                tracer.release(block, AllocationKind::Scalar);
            }
        });
    });

    group.finish();
}
