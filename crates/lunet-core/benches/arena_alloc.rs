use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lunet_core::Arena;

fn bench_sequential_allocs(c: &mut Criterion) {
    c.bench_function("arena_sequential_alloc_64b", |b| {
        b.iter(|| {
            let mut arena = Arena::new(1 << 20);
            for _ in 0..256 {
                black_box(arena.alloc(64).unwrap());
            }
        });
    });
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_alloc_free_cycle");

    for &size in &[32u32, 256, 4096] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut arena = Arena::new(1 << 20);
                for _ in 0..128 {
                    let block = arena.alloc(size).unwrap();
                    arena.free(black_box(block));
                }
            });
        });
    }

    group.finish();
}

fn bench_best_fit_reuse(c: &mut Criterion) {
    c.bench_function("arena_best_fit_reuse", |b| {
        b.iter(|| {
            let mut arena = Arena::new(1 << 20);
            let mut blocks = Vec::with_capacity(64);
            for i in 0..64 {
                blocks.push(arena.alloc(64 + i as u32).unwrap());
            }
            for &block in &blocks {
                arena.free(block);
            }
            for i in 0..64 {
                black_box(arena.alloc(32 + i as u32).unwrap());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_sequential_allocs,
    bench_alloc_free_cycle,
    bench_best_fit_reuse
);
criterion_main!(benches);
