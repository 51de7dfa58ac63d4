//! Benchmarks for the free-list pool family.
//!
//! Compares pooled alloc/free cycles against the system allocator for the
//! block sizes the library churns through most.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strata::pool::{BlockPool, FactoryPool};

fn bench_block_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_pool");
    for size in [256usize, 4096, 65536] {
        group.bench_with_input(BenchmarkId::new("pooled", size), &size, |b, &size| {
            let pool = BlockPool::new("bench-blocks").unwrap();
            // Warm the free list so the steady state is measured.
            let block = pool.alloc(size).unwrap();
            pool.free(block).unwrap();
            b.iter(|| {
                let block = pool.alloc(black_box(size)).unwrap();
                pool.free(block).unwrap();
            });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &size| {
            b.iter(|| {
                let block = vec![0u8; black_box(size)].into_boxed_slice();
                drop(black_box(block));
            });
        });
    }
    group.finish();
}

fn bench_factory_pool(c: &mut Criterion) {
    c.bench_function("factory_pool/alloc_free_4k", |b| {
        let factory = FactoryPool::new(4096).unwrap();
        let block = factory.alloc().unwrap();
        factory.free(block).unwrap();
        b.iter(|| {
            let block = factory.alloc().unwrap();
            factory.free(block).unwrap();
        });
    });
}

criterion_group!(benches, bench_block_pool, bench_factory_pool);
criterion_main!(benches);
