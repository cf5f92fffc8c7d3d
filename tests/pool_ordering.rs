//! Idle-set service order: LIFO vs FIFO.

use std::sync::atomic::{AtomicU64, Ordering};

use reservoir::{BoxError, Factory, Pool, PoolConfig};

/// Factory handing out consecutive integers 0, 1, 2, …
#[derive(Default)]
struct Sequence {
    next: AtomicU64,
}

impl Factory for Sequence {
    type Resource = u64;

    async fn make(&self) -> Result<u64, BoxError> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

fn pool(lifo: bool) -> Pool<Sequence> {
    Pool::new(
        Sequence::default(),
        PoolConfig {
            max_active: Some(8),
            lifo,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn lifo_serves_most_recently_returned() {
    let pool = pool(true);

    let v0 = pool.borrow().await.unwrap();
    let v1 = pool.borrow().await.unwrap();
    let v2 = pool.borrow().await.unwrap();
    assert_eq!((v0, v1, v2), (0, 1, 2));

    pool.give_back(v2).await;
    assert_eq!(pool.borrow().await.unwrap(), 2);

    pool.give_back(v1).await;
    assert_eq!(pool.borrow().await.unwrap(), 1);

    pool.give_back(v0).await;
    pool.give_back(2).await;
    assert_eq!(pool.borrow().await.unwrap(), 2);
}

#[tokio::test]
async fn fifo_serves_least_recently_returned() {
    let pool = pool(false);

    let v0 = pool.borrow().await.unwrap();
    let v1 = pool.borrow().await.unwrap();
    let v2 = pool.borrow().await.unwrap();
    assert_eq!((v0, v1, v2), (0, 1, 2));

    pool.give_back(v2).await;
    assert_eq!(pool.borrow().await.unwrap(), 2);

    pool.give_back(v1).await;
    assert_eq!(pool.borrow().await.unwrap(), 1);

    pool.give_back(v0).await;
    pool.give_back(2).await;
    assert_eq!(pool.borrow().await.unwrap(), 0);
}

#[tokio::test]
async fn add_idle_counts_as_most_recent() {
    let pool = pool(true);
    let v0 = pool.borrow().await.unwrap();
    pool.give_back(v0).await;
    pool.add_idle().await.unwrap();
    // The pre-filled entry (value 1) was idled last.
    assert_eq!(pool.borrow().await.unwrap(), 1);
    assert_eq!(pool.borrow().await.unwrap(), 0);
}

#[tokio::test]
async fn lifo_flip_takes_effect_on_next_borrow() {
    let pool = pool(true);
    let v0 = pool.borrow().await.unwrap();
    let v1 = pool.borrow().await.unwrap();
    pool.give_back(v0).await;
    pool.give_back(v1).await;

    assert_eq!(pool.borrow().await.unwrap(), 1, "lifo first");
    pool.give_back(1).await;

    pool.set_lifo(false);
    assert_eq!(pool.borrow().await.unwrap(), 0, "fifo after the flip");
}
