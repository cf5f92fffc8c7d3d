//! # reservoir
//!
//! A pooling core for expensive, reusable resources: database connections,
//! parsed artifacts, worker handles. A pool mediates between borrowers and a
//! user-supplied [`Factory`] that knows how to construct, validate, reset
//! and destroy resources. The pool caches idle resources, bounds
//! concurrency, suspends borrowers when capacity runs out, and sweeps stale
//! idle entries in the background.
//!
//! Two variants share one configuration surface:
//!
//! - [`Pool`] — a single logical pool.
//! - [`KeyedPool`] — one sub-pool per opaque key, with an additional
//!   cross-key `max_total` cap.
//!
//! ```
//! use reservoir::{BoxError, Factory, Pool, PoolConfig};
//!
//! struct Connections;
//!
//! impl Factory for Connections {
//!     type Resource = String;
//!
//!     async fn make(&self) -> Result<String, BoxError> {
//!         Ok("connection".to_owned())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let pool = Pool::new(Connections, PoolConfig::default());
//! let conn = pool.borrow().await?;
//! assert_eq!(conn, "connection");
//! pool.give_back(conn).await;
//! assert_eq!(pool.num_idle(), 1);
//! # Ok::<(), reservoir::Error>(())
//! # }).unwrap();
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod guard;
pub mod keyed;
pub mod pool;

mod entry;
mod evictor;
mod idle;

// Re-exports
pub use config::{ExhaustedAction, PoolConfig};
pub use error::{BoxError, Error, LifecycleStage, Result};
pub use factory::{Factory, KeyedFactory};
pub use guard::{Guard, KeyedGuard};
pub use keyed::KeyedPool;
pub use pool::{Pool, PoolStats};
