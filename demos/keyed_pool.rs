//! Keyed pooling walk-through
//!
//! One sub-pool per backend host, bounded globally by `max_total`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reservoir::{BoxError, ExhaustedAction, KeyedFactory, KeyedPool, PoolConfig};

struct Backends {
    next_id: AtomicU64,
}

impl KeyedFactory for Backends {
    type Key = String;
    type Resource = String;

    async fn make(&self, key: &String) -> Result<String, BoxError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(format!("{key}#{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let pool = KeyedPool::new(
        Backends {
            next_id: AtomicU64::new(0),
        },
        PoolConfig {
            max_active: Some(4),
            max_total: Some(6),
            when_exhausted: ExhaustedAction::Block,
            max_wait: Some(Duration::from_secs(2)),
            ..Default::default()
        },
    );

    println!("=== reservoir: keyed pool ===\n");

    for host in ["db-eu", "db-us", "db-ap"] {
        let key = host.to_owned();
        let conn = pool.borrow(&key).await?;
        println!("{host}: borrowed {conn}");
        pool.give_back(&key, conn).await;
    }

    println!("\npresent keys: {:?}", pool.keys());
    println!(
        "total in pool: {} active + {} idle (cap 6)",
        pool.num_active(),
        pool.num_idle()
    );

    // Reuse stays within a key.
    let key = "db-eu".to_owned();
    let again = pool.borrow(&key).await?;
    println!("\ndb-eu again: {again} (reused)");
    pool.give_back(&key, again).await;

    pool.close().await;
    println!("\npool closed; idle = {}", pool.num_idle());
    Ok(())
}
