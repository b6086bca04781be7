// Handle table throughput benchmarks: bulk creation, validation, and the
// delete/create churn pattern a real workload puts it through.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pal::{default_virtual_memory, Handle, HandleTable, MemoryLayout, TableFlags};

fn fresh_table(initial_commit: usize) -> HandleTable<impl pal::VirtualMemory> {
    let mut layout = MemoryLayout::new();
    layout.add_stream(32, 16).unwrap();
    HandleTable::new(default_virtual_memory(), 0, TableFlags::IDENTITY, layout, initial_commit).unwrap()
}

fn bench_create_ids_bulk(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_ids_bulk");

    for n in [64usize, 512, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let mut table = fresh_table(4);
                black_box(table.create_ids(n).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_validate_ids(c: &mut Criterion) {
    let mut table = fresh_table(4);
    let ids: Vec<Handle> = table.create_ids(4096).unwrap();

    c.bench_function("validate_ids_4096", |b| {
        b.iter(|| {
            table.validate_ids(black_box(&ids)).unwrap();
        });
    });
}

fn bench_delete_create_churn(c: &mut Criterion) {
    c.bench_function("delete_create_churn_1024", |b| {
        let mut table = fresh_table(1);
        let mut ids = table.create_ids(1024).unwrap();
        b.iter(|| {
            table.delete_ids(black_box(&ids)).unwrap();
            ids = table.create_ids(1024).unwrap();
        });
    });
}

fn bench_visit_vs_iter_chunks(c: &mut Criterion) {
    let mut table = fresh_table(4);
    table.create_ids(4096).unwrap();

    let mut group = c.benchmark_group("chunk_enumeration");
    group.bench_function("visit_closure", |b| {
        b.iter(|| {
            let mut total = 0usize;
            table
                .visit(|info| {
                    total += info.count;
                    true
                })
                .unwrap();
            black_box(total);
        });
    });
    group.bench_function("iter_chunks", |b| {
        b.iter(|| {
            let total: usize = table.iter_chunks().map(|info| info.count).sum();
            black_box(total);
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_create_ids_bulk,
    bench_validate_ids,
    bench_delete_create_churn,
    bench_visit_vs_iter_chunks
);
criterion_main!(benches);
