//! RAII checkout handles
//!
//! A guard wraps a borrowed resource and gives it back when dropped. The
//! return path (validate / passivate / destroy, as configured) is async, so
//! a plain `drop` spawns it onto the runtime; call
//! [`Guard::give_back`] to run it in place, or [`Guard::invalidate`] to
//! destroy the resource instead.

use std::ops::{Deref, DerefMut};

use crate::error::Result;
use crate::factory::{Factory, KeyedFactory};
use crate::keyed::KeyedPool;
use crate::pool::Pool;

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// RAII handle for a resource borrowed from a [`Pool`].
pub struct Guard<F: Factory> {
    value: Option<F::Resource>,
    pool: Pool<F>,
}

impl<F: Factory> Pool<F> {
    /// Borrow a resource wrapped in an RAII guard.
    pub async fn acquire(&self) -> Result<Guard<F>> {
        let value = self.borrow().await?;
        Ok(Guard {
            value: Some(value),
            pool: self.clone(),
        })
    }
}

impl<F: Factory> Guard<F> {
    /// Return the resource to the pool, running the return path in place
    /// instead of on a spawned task.
    pub async fn give_back(mut self) {
        if let Some(value) = self.value.take() {
            self.pool.give_back(value).await;
        }
    }

    /// Destroy the resource instead of returning it.
    pub async fn invalidate(mut self) -> Result<()> {
        match self.value.take() {
            Some(value) => self.pool.invalidate(value).await,
            None => Ok(()),
        }
    }
}

impl<F: Factory> Deref for Guard<F> {
    type Target = F::Resource;

    fn deref(&self) -> &F::Resource {
        self.value.as_ref().expect("resource present until guard is consumed")
    }
}

impl<F: Factory> DerefMut for Guard<F> {
    fn deref_mut(&mut self) -> &mut F::Resource {
        self.value.as_mut().expect("resource present until guard is consumed")
    }
}

impl<F: Factory> Drop for Guard<F> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let pool = self.pool.clone();
            drop(tokio::spawn(async move {
                pool.give_back(value).await;
            }));
        }
    }
}

impl<F: Factory> std::fmt::Debug for Guard<F>
where
    F::Resource: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard").field("value", &self.value).finish()
    }
}

// ---------------------------------------------------------------------------
// KeyedGuard
// ---------------------------------------------------------------------------

/// RAII handle for a resource borrowed from a [`KeyedPool`].
pub struct KeyedGuard<F: KeyedFactory> {
    key: F::Key,
    value: Option<F::Resource>,
    pool: KeyedPool<F>,
}

impl<F: KeyedFactory> KeyedPool<F> {
    /// Borrow a resource for `key`, wrapped in an RAII guard.
    pub async fn acquire(&self, key: &F::Key) -> Result<KeyedGuard<F>> {
        let value = self.borrow(key).await?;
        Ok(KeyedGuard {
            key: key.clone(),
            value: Some(value),
            pool: self.clone(),
        })
    }
}

impl<F: KeyedFactory> KeyedGuard<F> {
    /// The key this resource was borrowed under.
    pub fn key(&self) -> &F::Key {
        &self.key
    }

    /// Return the resource to its sub-pool, running the return path in
    /// place instead of on a spawned task.
    pub async fn give_back(mut self) {
        if let Some(value) = self.value.take() {
            self.pool.give_back(&self.key, value).await;
        }
    }

    /// Destroy the resource instead of returning it.
    pub async fn invalidate(mut self) -> Result<()> {
        match self.value.take() {
            Some(value) => self.pool.invalidate(&self.key, value).await,
            None => Ok(()),
        }
    }
}

impl<F: KeyedFactory> Deref for KeyedGuard<F> {
    type Target = F::Resource;

    fn deref(&self) -> &F::Resource {
        self.value.as_ref().expect("resource present until guard is consumed")
    }
}

impl<F: KeyedFactory> DerefMut for KeyedGuard<F> {
    fn deref_mut(&mut self) -> &mut F::Resource {
        self.value.as_mut().expect("resource present until guard is consumed")
    }
}

impl<F: KeyedFactory> Drop for KeyedGuard<F> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let pool = self.pool.clone();
            let key = self.key.clone();
            drop(tokio::spawn(async move {
                pool.give_back(&key, value).await;
            }));
        }
    }
}

impl<F: KeyedFactory> std::fmt::Debug for KeyedGuard<F>
where
    F::Resource: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedGuard")
            .field("key", &self.key)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::error::BoxError;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Numbers {
        next: AtomicU64,
    }

    impl Factory for Numbers {
        type Resource = u64;

        async fn make(&self) -> std::result::Result<u64, BoxError> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[derive(Default)]
    struct KeyedNumbers {
        next: AtomicU64,
    }

    impl KeyedFactory for KeyedNumbers {
        type Key = String;
        type Resource = u64;

        async fn make(&self, _key: &String) -> std::result::Result<u64, BoxError> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn guard_derefs_to_resource() {
        let pool = Pool::new(Numbers::default(), PoolConfig::default());
        let guard = pool.acquire().await.unwrap();
        assert_eq!(*guard, 0);
        guard.give_back().await;
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.num_active(), 0);
    }

    #[tokio::test]
    async fn dropping_guard_returns_resource() {
        let pool = Pool::new(Numbers::default(), PoolConfig::default());
        {
            let _guard = pool.acquire().await.unwrap();
            assert_eq!(pool.num_active(), 1);
        }
        // The return runs on a spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 1);
    }

    #[tokio::test]
    async fn guard_invalidate_destroys() {
        let pool = Pool::new(Numbers::default(), PoolConfig::default());
        let guard = pool.acquire().await.unwrap();
        guard.invalidate().await.unwrap();
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 0);
        // Next borrow is a fresh resource.
        let next = pool.acquire().await.unwrap();
        assert_eq!(*next, 1);
        next.give_back().await;
    }

    #[tokio::test]
    async fn keyed_guard_round_trip() {
        let pool = KeyedPool::new(KeyedNumbers::default(), PoolConfig::default());
        let key = "alpha".to_owned();
        let guard = pool.acquire(&key).await.unwrap();
        assert_eq!(guard.key(), &key);
        assert_eq!(*guard, 0);
        guard.give_back().await;
        assert_eq!(pool.num_idle_key(&key), 1);

        {
            let _guard = pool.acquire(&key).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.num_idle_key(&key), 1);
        assert_eq!(pool.num_active(), 0);
    }
}
