//! Throughput of the boundary-tag allocator under single-writer
//! contention: the hot path every `message_init`/`send`/`release` call
//! goes through.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use memmap2::MmapOptions;
use peerlink::arena::Arena;

fn make_arena(buffer_size: u64, max_message_size: u64) -> Arena {
    let total_len = core::mem::size_of::<peerlink::arena::ArenaHeader>() as u64 + buffer_size;
    let map = MmapOptions::new()
        .len(total_len as usize)
        .map_anon()
        .unwrap()
        .into();
    Arena::create(map, total_len, max_message_size, "bench")
}

fn alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");
    for max_message_size in [64u64, 512, 4096] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(max_message_size),
            &max_message_size,
            |b, &size| {
                let arena = make_arena(1 << 20, size);
                b.iter(|| {
                    let p = arena.alloc().unwrap();
                    arena.free(p).unwrap();
                });
            },
        );
    }
    group.finish();
}

fn alloc_trim_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_trim_free");
    group.throughput(Throughput::Elements(1));
    group.bench_function("trim_to_16_bytes", |b| {
        let arena = make_arena(1 << 20, 4096);
        b.iter(|| {
            let p = arena.alloc().unwrap();
            arena.trim(p, 16).unwrap();
            arena.free(p).unwrap();
        });
    });
    group.finish();
}

fn contended_alloc_until_full(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_to_empty");
    group.throughput(Throughput::Elements(1));
    group.bench_function("fill_then_free_all", |b| {
        b.iter_batched(
            || make_arena(1 << 16, 128),
            |arena| {
                let mut blocks = Vec::new();
                while let Ok(p) = arena.alloc() {
                    blocks.push(p);
                }
                for p in blocks {
                    arena.free(p).unwrap();
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, alloc_free, alloc_trim_free, contended_alloc_until_full);
criterion_main!(benches);
