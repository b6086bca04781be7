// Allocator family throughput benchmarks: arena bump allocation, buddy
// allocator split/free cycling, and dynamic buffer growth.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pal::{default_virtual_memory, Arena, BuddyAllocator, DynamicBuffer, MemoryDomain};

fn bench_arena_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_allocate");

    for size in [16usize, 64, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let arena = Arena::new(MemoryDomain::Host, 0, 64 * 1024 * 1024);
            b.iter(|| {
                let marker = arena.mark();
                for _ in 0..256 {
                    black_box(arena.allocate(black_box(size), 16).unwrap());
                }
                arena.reset_to_marker(marker).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_buddy_allocate_free_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("buddy_allocate_free_cycle");

    for size in [64usize, 256, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut allocator =
                BuddyAllocator::new(0, 16 * 1024 * 1024, 64, 16 * 1024 * 1024, MemoryDomain::Host)
                    .unwrap();
            b.iter(|| {
                let block = allocator.allocate(black_box(size), 64).unwrap();
                allocator.free(block).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_buddy_mixed_size_churn(c: &mut Criterion) {
    c.bench_function("buddy_mixed_size_churn", |b| {
        let mut allocator =
            BuddyAllocator::new(0, 16 * 1024 * 1024, 64, 16 * 1024 * 1024, MemoryDomain::Host)
                .unwrap();
        let sizes = [64usize, 128, 256, 512, 1024];
        b.iter(|| {
            let blocks: Vec<_> = sizes
                .iter()
                .map(|&s| allocator.allocate(black_box(s), 64).unwrap())
                .collect();
            for block in blocks {
                allocator.free(block).unwrap();
            }
        });
    });
}

fn bench_dynamic_buffer_growth(c: &mut Criterion) {
    c.bench_function("dynamic_buffer_ensure_growth", |b| {
        b.iter(|| {
            let mut buffer: DynamicBuffer<_> =
                DynamicBuffer::new(default_virtual_memory(), 8, 1 << 20, 4096).unwrap();
            for count in (4096..(1 << 16)).step_by(4096) {
                buffer.ensure(black_box(count)).unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_arena_allocate,
    bench_buddy_allocate_free_cycle,
    bench_buddy_mixed_size_churn,
    bench_dynamic_buffer_growth
);
criterion_main!(benches);
