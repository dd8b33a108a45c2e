//! In-memory lock store
//!
//! Keys expire on the tokio clock, so tests running with a paused clock see
//! deterministic expiry. The store can be switched unreachable and given an
//! artificial per-call latency to model partitions and slow links.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep};

use super::LockStore;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local lock store
#[derive(Debug)]
pub struct InMemoryStore {
    name: String,
    entries: Mutex<HashMap<String, Entry>>,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
    set_calls: AtomicU64,
    delete_calls: AtomicU64,
}

impl InMemoryStore {
    /// Create an empty, reachable store
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            set_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
        }
    }

    /// Make the store reachable or unreachable
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Whether the store currently answers requests
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Delay every primitive by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of conditional-set calls received, reachable or not
    pub fn set_calls(&self) -> u64 {
        self.set_calls.load(Ordering::SeqCst)
    }

    /// Number of conditional-delete calls received, reachable or not
    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Current unexpired value of `key`
    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries();
        live_entry(&mut entries, key).map(|entry| entry.value.clone())
    }

    /// Remaining time before `key` expires
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut entries = self.entries();
        live_entry(&mut entries, key)
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Number of unexpired keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    /// Whether the store holds no unexpired keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_link(&self) -> StoreResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            sleep(Duration::from_millis(latency)).await;
        }

        if !self.is_reachable() {
            return Err(StoreError::Unreachable {
                store: self.name.clone(),
                reason: "store is partitioned".to_string(),
            });
        }
        Ok(())
    }
}

/// Look up `key`, dropping it first if it has expired
fn live_entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a Entry> {
    if entries
        .get(key)
        .is_some_and(|entry| entry.expires_at <= Instant::now())
    {
        entries.remove(key);
    }
    entries.get(key)
}

#[async_trait]
impl LockStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_link().await?;

        let now = Instant::now();
        let mut entries = self.entries();
        entries.retain(|_, entry| entry.expires_at > now);
        if entries.contains_key(key) {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + Duration::from_millis(ttl_ms),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_link().await?;

        let mut entries = self.entries();
        match live_entry(&mut entries, key) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent() {
        let store = InMemoryStore::new("a");

        assert!(store.try_set_if_absent("res", "t1", 1000).await.unwrap());
        assert!(!store.try_set_if_absent("res", "t2", 1000).await.unwrap());
        assert_eq!(store.get("res").as_deref(), Some("t1"));
        assert_eq!(store.set_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_expires() {
        let store = InMemoryStore::new("a");
        store.try_set_if_absent("res", "t1", 100).await.unwrap();

        tokio::time::advance(Duration::from_millis(100)).await;

        assert!(store.get("res").is_none());
        assert!(store.try_set_if_absent("res", "t2", 100).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_keys_are_swept_on_set() {
        let store = InMemoryStore::new("a");
        for i in 0..50 {
            store
                .try_set_if_absent(&format!("job:{}", i), "t", 100)
                .await
                .unwrap();
        }
        assert_eq!(store.entries().len(), 50);

        tokio::time::advance(Duration::from_millis(100)).await;
        store.try_set_if_absent("other", "t", 1000).await.unwrap();

        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_delete_checks_token() {
        let store = InMemoryStore::new("a");
        store.try_set_if_absent("res", "owner", 1000).await.unwrap();

        assert!(!store.compare_and_delete("res", "intruder").await.unwrap());
        assert_eq!(store.get("res").as_deref(), Some("owner"));

        assert!(store.compare_and_delete("res", "owner").await.unwrap());
        assert!(store.is_empty());

        assert!(!store.compare_and_delete("res", "owner").await.unwrap());
        assert_eq!(store.delete_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_store() {
        let store = InMemoryStore::new("down");
        store.set_reachable(false);

        let err = store.try_set_if_absent("res", "t", 1000).await.unwrap_err();
        assert!(matches!(err, StoreError::Unreachable { .. }));
        assert_eq!(store.set_calls(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_consumes_clock() {
        let store = InMemoryStore::new("slow");
        store.set_latency(Duration::from_millis(25));

        let start = Instant::now();
        store.try_set_if_absent("res", "t", 1000).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(25));
        assert_eq!(store.ttl("res"), Some(Duration::from_millis(1000)));
    }
}
