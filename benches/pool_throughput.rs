// Pool throughput benchmarks.
//
// Measures raw borrow/return overhead with a zero-cost resource (no I/O,
// instant make/validate/destroy).

use std::hint::black_box;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use reservoir::{BoxError, Factory, Pool, PoolConfig};

// -- Minimal no-op factory for measuring pool overhead only --

struct NoOp;

impl Factory for NoOp {
    type Resource = u64;

    async fn make(&self) -> Result<u64, BoxError> {
        Ok(0)
    }
}

fn pool_config(max_active: usize) -> PoolConfig {
    PoolConfig {
        max_active: Some(max_active),
        max_idle: Some(max_active),
        max_wait: Some(Duration::from_secs(5)),
        ..Default::default()
    }
}

fn single_thread_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("failed to build runtime");

    let pool = Pool::new(NoOp, pool_config(64));

    // Warm up: borrow and return one resource so subsequent borrows reuse it.
    rt.block_on(async {
        let v = pool.borrow().await.unwrap();
        pool.give_back(v).await;
    });

    c.bench_function("single_thread_borrow_return", |b| {
        b.to_async(&rt).iter(|| {
            let pool = pool.clone();
            async move {
                let value = pool.borrow().await.unwrap();
                pool.give_back(value).await;
                black_box(())
            }
        });
    });
}

fn guard_drop_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("failed to build runtime");

    let pool = Pool::new(NoOp, pool_config(64));

    c.bench_function("guard_acquire_drop", |b| {
        b.to_async(&rt).iter(|| {
            let pool = pool.clone();
            async move {
                let guard = pool.acquire().await.unwrap();
                drop(guard);
                // Yield so the spawned return task runs.
                tokio::task::yield_now().await;
                black_box(())
            }
        });
    });
}

fn contended_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("failed to build runtime");

    // Small pool to create contention.
    let pool = Pool::new(NoOp, pool_config(4));

    c.bench_function("contended_borrow_return_4slots", |b| {
        b.to_async(&rt).iter(|| {
            let pool = pool.clone();
            async move {
                let value = pool.borrow().await.unwrap();
                pool.give_back(value).await;
                black_box(())
            }
        });
    });
}

criterion_group!(
    benches,
    single_thread_throughput,
    guard_drop_throughput,
    contended_throughput,
);
criterion_main!(benches);
