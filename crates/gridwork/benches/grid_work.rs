//! Work Graph Benchmarks
//!
//! End-to-end cost of staging copies and elementwise operations on the CPU
//! backend, plus stream acquisition from a warm pool.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gridwork::prelude::*;

fn pool() -> Arc<StreamPool> {
    let config = RuntimeConfig {
        initial_streams: 4,
        ..RuntimeConfig::default()
    };
    Arc::new(StreamPool::with_config(&config).expect("cpu pool"))
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("grid_work/round_trip");
    let pool = pool();

    for &dim in &[32usize, 128, 256] {
        let mut grid = Grid::<f32, 2, 1, 3>::new([dim, dim]);
        grid.staging_mds_mut().fill(1.0);
        group.throughput(Throughput::Elements((dim * dim) as u64));

        group.bench_function(BenchmarkId::from_parameter(dim), |b| {
            b.iter(|| {
                let mut work = pool.work().expect("stream");
                work.sync_from_staging(&mut grid)
                    .and_then(|w| {
                        w.for_each(&mut grid, |mut v| {
                            v[[0]] = v[[1]] + v[[2]];
                        })
                    })
                    .and_then(|w| w.sync_to_staging(&mut grid))
                    .and_then(|w| w.wait())
                    .expect("work");
            });
        });
    }

    group.finish();
}

fn bench_stream_acquire(c: &mut Criterion) {
    let pool = pool();

    c.bench_function("grid_work/stream_acquire", |b| {
        b.iter(|| {
            let handle = pool.get().expect("stream");
            black_box(handle.get().expect("active"));
        });
    });
}

fn bench_split_join(c: &mut Criterion) {
    let pool = pool();

    c.bench_function("grid_work/split3_join", |b| {
        b.iter(|| {
            let mut root = pool.work().expect("stream");
            let [mut a, mut b2, mut c2] = root.split::<3>().expect("split");
            when_all([&mut root, &mut a, &mut b2, &mut c2]).expect("join");
            root.wait().expect("wait");
        });
    });
}

criterion_group!(benches, bench_round_trip, bench_stream_acquire, bench_split_join);
criterion_main!(benches);
