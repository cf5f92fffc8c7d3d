//! Simple pooling walk-through
//!
//! Pools fake database connections, exercises borrow/return, the RAII
//! guard, and a manual eviction sweep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reservoir::{BoxError, Factory, Pool, PoolConfig};

struct Connections {
    next_id: AtomicU64,
}

struct Connection {
    id: u64,
}

impl Factory for Connections {
    type Resource = Connection;

    async fn make(&self) -> Result<Connection, BoxError> {
        // Simulate connection setup.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Connection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn validate(&self, conn: &Connection) -> Result<bool, BoxError> {
        Ok(conn.id < 1_000)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let pool = Pool::new(
        Connections {
            next_id: AtomicU64::new(0),
        },
        PoolConfig {
            max_active: Some(4),
            min_idle: 1,
            test_on_borrow: true,
            min_evictable_idle: Some(Duration::from_secs(60)),
            ..Default::default()
        },
    );

    println!("=== reservoir: simple pool ===\n");

    // Borrow and return explicitly.
    let conn = pool.borrow().await?;
    println!("borrowed connection {}", conn.id);
    pool.give_back(conn).await;
    println!("returned; idle = {}", pool.num_idle());

    // Or let a guard return it on drop.
    {
        let guard = pool.acquire().await?;
        println!("guard holds connection {}", guard.id);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A manual sweep restores the idle floor.
    pool.evict().await;

    let stats = pool.stats();
    println!("\nstatistics:");
    println!("  borrows: {}", stats.total_borrows);
    println!("  created: {}", stats.created);
    println!("  idle:    {}", stats.idle);

    pool.close().await;
    println!("\npool closed; idle = {}", pool.num_idle());
    Ok(())
}
