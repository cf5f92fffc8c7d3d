//! Factory capability traits
//!
//! A factory knows how to construct, prepare, check, reset and release one
//! kind of resource. The pool drives every lifecycle transition through these
//! callbacks and never touches the resource value itself.
//!
//! Only `make` is mandatory. The remaining callbacks default to no-ops that
//! accept every resource, so a minimal factory is a single method:
//!
//! ```
//! use reservoir::{BoxError, Factory};
//!
//! struct Conns;
//!
//! impl Factory for Conns {
//!     type Resource = String;
//!
//!     async fn make(&self) -> Result<String, BoxError> {
//!         Ok("connection".to_owned())
//!     }
//! }
//! ```

use std::future::Future;
use std::hash::Hash;

use crate::error::BoxError;

/// Factory for a single logical pool.
///
/// All callbacks run with the pool lock released; they may be arbitrarily
/// slow without stalling other borrowers. Errors returned from `validate`
/// are treated the same as `Ok(false)`.
pub trait Factory: Send + Sync + 'static {
    /// The resource type produced by this factory.
    type Resource: Send + 'static;

    /// Construct a brand-new resource.
    fn make(&self) -> impl Future<Output = Result<Self::Resource, BoxError>> + Send;

    /// Prepare a resource just before handing it to a borrower.
    fn activate(
        &self,
        _resource: &mut Self::Resource,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        async { Ok(()) }
    }

    /// Quick liveness check.
    fn validate(
        &self,
        _resource: &Self::Resource,
    ) -> impl Future<Output = Result<bool, BoxError>> + Send {
        async { Ok(true) }
    }

    /// Reset a resource before it re-enters the idle set.
    fn passivate(
        &self,
        _resource: &mut Self::Resource,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        async { Ok(()) }
    }

    /// Release the underlying resource. Invoked best-effort; errors are
    /// swallowed everywhere except [`Pool::invalidate`](crate::Pool::invalidate).
    fn destroy(
        &self,
        resource: Self::Resource,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        async {
            drop(resource);
            Ok(())
        }
    }
}

/// Factory for a keyed pool: every callback additionally receives the opaque
/// key identifying the sub-pool the resource belongs to.
pub trait KeyedFactory: Send + Sync + 'static {
    /// The key type multiplexing the sub-pools.
    type Key: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static;

    /// The resource type produced by this factory.
    type Resource: Send + 'static;

    /// Construct a brand-new resource for `key`.
    fn make(&self, key: &Self::Key) -> impl Future<Output = Result<Self::Resource, BoxError>> + Send;

    /// Prepare a resource just before handing it to a borrower.
    fn activate(
        &self,
        _key: &Self::Key,
        _resource: &mut Self::Resource,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        async { Ok(()) }
    }

    /// Quick liveness check.
    fn validate(
        &self,
        _key: &Self::Key,
        _resource: &Self::Resource,
    ) -> impl Future<Output = Result<bool, BoxError>> + Send {
        async { Ok(true) }
    }

    /// Reset a resource before it re-enters the idle set.
    fn passivate(
        &self,
        _key: &Self::Key,
        _resource: &mut Self::Resource,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        async { Ok(()) }
    }

    /// Release the underlying resource. Errors are swallowed everywhere
    /// except [`KeyedPool::invalidate`](crate::KeyedPool::invalidate).
    fn destroy(
        &self,
        _key: &Self::Key,
        resource: Self::Resource,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        async {
            drop(resource);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    impl Factory for Minimal {
        type Resource = u32;

        async fn make(&self) -> Result<u32, BoxError> {
            Ok(7)
        }
    }

    struct MinimalKeyed;

    impl KeyedFactory for MinimalKeyed {
        type Key = String;
        type Resource = u32;

        async fn make(&self, _key: &String) -> Result<u32, BoxError> {
            Ok(7)
        }
    }

    #[tokio::test]
    async fn defaults_accept_everything() {
        let f = Minimal;
        let mut v = f.make().await.unwrap();
        f.activate(&mut v).await.unwrap();
        assert!(f.validate(&v).await.unwrap());
        f.passivate(&mut v).await.unwrap();
        f.destroy(v).await.unwrap();
    }

    #[tokio::test]
    async fn keyed_defaults_accept_everything() {
        let f = MinimalKeyed;
        let key = "a".to_owned();
        let mut v = f.make(&key).await.unwrap();
        f.activate(&key, &mut v).await.unwrap();
        assert!(f.validate(&key, &v).await.unwrap());
        f.passivate(&key, &mut v).await.unwrap();
        f.destroy(&key, v).await.unwrap();
    }
}
