//! Lock store capability
//!
//! A lock store is one independent key/value server with expiring keys. The
//! coordinator only ever needs two atomic primitives from it:
//!
//! - a conditional set that creates a key only if it is absent, with an expiry
//! - a token-checked delete that removes a key only if it still holds the
//!   caller's value
//!
//! Backends:
//!
//! - [`InMemoryStore`] for tests and single-process use (`memory://<name>`)
//! - [`RedisStore`] over `SET NX PX` and a Lua check-and-delete
//!   (`redis://<host>:<port>`, feature `redis`)

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result, StoreResult};

pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// One independent lock store
///
/// Implementations must make both primitives atomic on the server side. A
/// client-side read followed by a delete is not an acceptable
/// `compare_and_delete`.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Human-readable store name used in logs and reports
    fn name(&self) -> &str;

    /// Create `key` holding `value` with an expiry of `ttl_ms`, only if the
    /// key does not exist
    ///
    /// Returns `Ok(false)` when the key is already present.
    async fn try_set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool>;

    /// Delete `key` only if it currently holds exactly `expected`
    ///
    /// Returns `Ok(false)` when the key is absent or holds another value.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;
}

/// Open a lock store from its URL
///
/// Supported schemes are `memory://<name>` and, with the `redis` feature,
/// `redis://`, `rediss://` and `redis+unix://`.
pub fn open_store(url: &str, timeout: Duration) -> Result<Arc<dyn LockStore>> {
    if let Some(name) = url.strip_prefix("memory://") {
        let name = if name.is_empty() { "memory" } else { name };
        return Ok(Arc::new(InMemoryStore::new(name)));
    }

    if let Some(store) = open_redis_store(url, timeout)? {
        return Ok(store);
    }

    Err(Error::UnsupportedStore(url.to_string()))
}

#[cfg(feature = "redis")]
fn open_redis_store(url: &str, timeout: Duration) -> Result<Option<Arc<dyn LockStore>>> {
    const SCHEMES: [&str; 3] = ["redis://", "rediss://", "redis+unix://"];

    if SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        let store: Arc<dyn LockStore> = Arc::new(RedisStore::open(url, timeout)?);
        Ok(Some(store))
    } else {
        Ok(None)
    }
}

#[cfg(not(feature = "redis"))]
fn open_redis_store(_url: &str, _timeout: Duration) -> Result<Option<Arc<dyn LockStore>>> {
    Ok(None)
}
