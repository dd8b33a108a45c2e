//! Redis lock store
//!
//! The conditional set is `SET key token NX PX ttl`. The conditional delete
//! is a Lua script so the compare and the delete run as one server-side step.
//! The connection is opened lazily and every call is bounded by the store's
//! operation timeout. A connection that fails or times out is dropped and
//! reopened on the next call, so a restarted server rejoins the quorum.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::LockStore;
use crate::error::{Error, Result, StoreError, StoreResult};

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lock store backed by one Redis server
pub struct RedisStore {
    name: String,
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    timeout: Duration,
    unlock_script: Script,
}

impl RedisStore {
    /// Create a store for `url` without connecting
    pub fn open(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| Error::Config(format!("Invalid Redis URL '{}': {}", url, e)))?;
        let name = client.get_connection_info().addr.to_string();

        Ok(Self {
            name,
            client,
            connection: Mutex::new(None),
            timeout,
            unlock_script: Script::new(UNLOCK_SCRIPT),
        })
    }

    async fn connection(&self) -> StoreResult<MultiplexedConnection> {
        let mut cached = self.connection.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }

        debug!(store = %self.name, "Connecting to Redis");
        let conn = self
            .bounded(self.client.get_multiplexed_async_connection())
            .await?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    /// Run a command on the connection, dropping the connection if the
    /// server stopped answering
    async fn call<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let result = self.bounded(fut).await;
        if let Err(err) = &result
            && forces_reconnect(err)
        {
            debug!(store = %self.name, error = %err, "Dropping Redis connection");
            self.connection.lock().await.take();
        }
        result
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.classify(e)),
            Err(_) => Err(StoreError::Timeout {
                store: self.name.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    fn classify(&self, err: RedisError) -> StoreError {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Unreachable {
                store: self.name.clone(),
                reason: err.to_string(),
            }
        } else {
            StoreError::Backend {
                store: self.name.clone(),
                reason: err.to_string(),
            }
        }
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field(
                "connected",
                &self.connection.try_lock().is_ok_and(|conn| conn.is_some()),
            )
            .finish()
    }
}

fn forces_reconnect(err: &StoreError) -> bool {
    matches!(err, StoreError::Unreachable { .. } | StoreError::Timeout { .. })
}

#[async_trait]
impl LockStore for RedisStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(ttl_ms);

        let reply: Option<String> = self.call(cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let mut invocation = self.unlock_script.prepare_invoke();
        invocation.key(key).arg(expected);

        let deleted: i64 = self.call(invocation.invoke_async(&mut conn)).await?;
        Ok(deleted == 1)
    }
}
