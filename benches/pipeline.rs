use std::sync::Arc;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use kyroflux::testing::TestSubscriber;
use kyroflux::{Flux, Scheduler, SchedulerConfig, Schedulers};

const ITEMS: usize = 10_000;

fn bench_map_filter_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("operator_chain");
    group.throughput(Throughput::Elements(ITEMS as u64));

    let chain = Flux::range(0, ITEMS)
        .map(|n| n * 3)
        .filter(|n| n % 2 == 0)
        .skip(10)
        .take(ITEMS as u64);

    group.bench_function("map_filter_skip_take", |b| {
        b.iter(|| black_box(chain.block_collect().unwrap()));
    });

    group.bench_function("request_one_at_a_time", |b| {
        b.iter(|| {
            let probe = TestSubscriber::with_request(1);
            Flux::range(0, 1_000).map(|n| n + 1).subscribe(probe.clone());
            for _ in 0..1_000 {
                probe.request(1);
            }
            black_box(probe.is_complete())
        });
    });

    group.finish();
}

fn bench_flat_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("flat_map");
    group.throughput(Throughput::Elements(ITEMS as u64));

    for concurrency in [1usize, 8, 32] {
        let merged = Flux::range(0, ITEMS / 100).flat_map(
            |n| Flux::range(n * 100, 100),
            concurrency,
            32,
        );
        group.bench_function(format!("concurrency_{concurrency}"), |b| {
            b.iter(|| black_box(merged.count().block_last().unwrap()));
        });
    }

    group.finish();
}

fn bench_publish_on(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_on");
    group.throughput(Throughput::Elements(ITEMS as u64));

    group.bench_function("hop_to_pool", |b| {
        b.iter_custom(|iters| {
            // Fresh pool per sample so queued work does not leak between samples.
            let pool = Schedulers::new_parallel(SchedulerConfig {
                name: "bench-publish".to_string(),
                workers: 2,
                queue_capacity: 1024,
            });
            let hop = Flux::range(0, ITEMS).publish_on(Arc::clone(&pool));

            let start = Instant::now();
            for _ in 0..iters {
                black_box(hop.block_last().unwrap());
            }
            let elapsed = start.elapsed();
            pool.dispose();
            elapsed
        });
    });

    group.finish();
}

criterion_group!(pipeline, bench_map_filter_chain, bench_flat_map, bench_publish_on);
criterion_main!(pipeline);
