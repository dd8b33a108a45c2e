//! Lock coordinator
//!
//! Acquires a time-bounded lock by getting a majority of independent stores
//! to accept the same token, and releases it with a token-checked delete on
//! every store. It handles:
//! - Quorum counting over stores that may be slow, down or partitioned
//! - Clock drift accounting on the validity window
//! - Bounded retries with randomized jitter
//! - Undoing partial acquisitions

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::event::{EventPublisher, LockEvent};
use super::guard::LockGuard;
use super::types::{
    AcquireOutcome, AcquireReport, AttemptTally, CoordinatorConfig, LockHandle, LockRequest,
    LockState, ReleaseReport,
};
use crate::error::{Error, Result};
use crate::store::LockStore;

/// Result of the conditional set on one store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetOutcome {
    Acquired,
    Rejected,
    Unreachable,
}

/// Quorum lock coordinator
///
/// Immutable once built. Every call owns its token, start time and retry
/// counter, so one coordinator can be shared behind an `Arc` by any number
/// of concurrent callers.
pub struct LockCoordinator {
    /// Independent stores, attempted in this order
    stores: Vec<Arc<dyn LockStore>>,

    /// Validated quorum
    quorum: usize,

    /// Configuration
    config: CoordinatorConfig,

    /// Optional sink for lock events
    events: Option<Arc<dyn EventPublisher>>,
}

impl LockCoordinator {
    /// Create a coordinator with an explicit quorum and default tuning
    pub fn new(stores: Vec<Arc<dyn LockStore>>, quorum: usize) -> Result<Self> {
        Self::configure(stores, CoordinatorConfig::new(quorum))
    }

    /// Create a coordinator from a full configuration
    ///
    /// Fails fast on a missing quorum, a quorum larger than the store count,
    /// zero retries or an out-of-range drift factor.
    pub fn configure(stores: Vec<Arc<dyn LockStore>>, config: CoordinatorConfig) -> Result<Self> {
        let quorum = config.validate(stores.len())?;

        debug!(
            stores = stores.len(),
            quorum,
            retry_count = config.retry_count,
            retry_delay_ms = config.retry_delay.as_millis() as u64,
            "Lock coordinator configured"
        );

        Ok(Self {
            stores,
            quorum,
            config,
            events: None,
        })
    }

    /// Attach a publisher for lock events
    pub fn with_event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(publisher);
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Quorum required for an acquisition
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Names of the configured stores, in attempt order
    pub fn store_names(&self) -> Vec<&str> {
        self.stores.iter().map(|s| s.name()).collect()
    }

    /// Acquire a lock on `resource` valid for at most `ttl_ms`
    ///
    /// Returns `Ok(None)` when quorum could not be reached within the
    /// configured attempts. Errors are reserved for invalid arguments.
    pub async fn acquire(&self, resource: &str, ttl_ms: u64) -> Result<Option<LockHandle>> {
        Ok(self
            .acquire_with_report(resource, ttl_ms)
            .await?
            .into_handle())
    }

    /// Acquire a lock and report per-store results when it fails
    pub async fn acquire_with_report(&self, resource: &str, ttl_ms: u64) -> Result<AcquireOutcome> {
        if resource.is_empty() {
            return Err(Error::EmptyResource);
        }
        if ttl_ms == 0 {
            return Err(Error::InvalidTtl(ttl_ms));
        }

        debug!(resource, ttl_ms, "Attempting to acquire lock");

        let mut last_attempt = AttemptTally::default();

        for attempt in 1..=self.config.retry_count {
            let request = LockRequest::new(resource, ttl_ms);
            let start = Instant::now();
            debug!(resource, attempt, state = %LockState::Attempting, "Lock attempt started");

            let outcomes = self.lock_all(&request).await;
            let tally = tally(&outcomes);

            let validity = request.validity(start.elapsed(), self.config.clock_drift_factor);

            match validity {
                Some(validity) if tally.acquired >= self.quorum => {
                    let handle = LockHandle::new(request, validity);
                    info!(
                        resource,
                        attempt,
                        acquired = tally.acquired,
                        validity_ms = handle.validity_ms,
                        "Lock acquired"
                    );
                    self.publish(LockEvent::lock_acquired(&handle, tally.acquired, attempt))
                        .await;
                    return Ok(AcquireOutcome::Acquired(handle));
                }
                _ => {
                    debug!(
                        resource,
                        attempt,
                        acquired = tally.acquired,
                        rejected = tally.rejected,
                        unreachable = tally.unreachable,
                        quorum = self.quorum,
                        validity_left = validity.is_some(),
                        state = %LockState::Unacquired,
                        "Lock attempt failed"
                    );
                }
            }

            self.undo(&request, &outcomes).await;
            last_attempt = tally;

            if attempt < self.config.retry_count {
                sleep(jittered_delay(self.config.retry_delay)).await;
            }
        }

        let report = AcquireReport {
            resource: resource.to_string(),
            attempts: self.config.retry_count,
            quorum: self.quorum,
            last_attempt,
        };

        if report.quorum_unreachable() {
            warn!(
                resource,
                unreachable = last_attempt.unreachable,
                quorum = self.quorum,
                "Lock not acquired: too many stores unreachable"
            );
        } else {
            info!(resource, attempts = report.attempts, "Lock not acquired: resource busy");
        }
        self.publish(LockEvent::acquire_failed(&report)).await;

        Ok(AcquireOutcome::Failed(report))
    }

    /// Release a lock on every store
    ///
    /// Each store deletes the key only if it still holds this handle's
    /// token. No quorum is needed and failures are tolerated; any store that
    /// misses the release expires the key on its own.
    pub async fn release(&self, handle: &LockHandle) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        for store in &self.stores {
            match store
                .compare_and_delete(&handle.resource, handle.token.as_str())
                .await
            {
                Ok(true) => report.deleted += 1,
                Ok(false) => report.not_held += 1,
                Err(e) => {
                    warn!(store = store.name(), resource = %handle.resource, error = %e, "Release failed on store");
                    report.unreachable += 1;
                }
            }
        }

        info!(
            resource = %handle.resource,
            deleted = report.deleted,
            not_held = report.not_held,
            unreachable = report.unreachable,
            "Lock released"
        );
        self.publish(LockEvent::lock_released(handle, &report)).await;

        report
    }

    /// Acquire a lock wrapped in a guard that releases it when dropped
    pub async fn lock(self: &Arc<Self>, resource: &str, ttl_ms: u64) -> Result<Option<LockGuard>> {
        Ok(self
            .acquire(resource, ttl_ms)
            .await?
            .map(|handle| LockGuard::new(Arc::clone(self), handle)))
    }

    /// Run `f` while holding a lock on `resource`, then release it
    ///
    /// Returns `Ok(None)` without calling `f` when the lock is not acquired.
    /// `f` should check the handle's validity before relying on exclusivity
    /// for long-running work.
    pub async fn with_lock<F, Fut, T>(&self, resource: &str, ttl_ms: u64, f: F) -> Result<Option<T>>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(handle) = self.acquire(resource, ttl_ms).await? else {
            return Ok(None);
        };

        let value = f(handle.clone()).await;
        self.release(&handle).await;
        Ok(Some(value))
    }

    // ========== Store Primitives ==========

    /// Run the conditional set on every store, in order
    async fn lock_all(&self, request: &LockRequest) -> Vec<SetOutcome> {
        let mut outcomes = Vec::with_capacity(self.stores.len());
        for store in &self.stores {
            outcomes.push(lock_instance(store.as_ref(), request).await);
        }
        outcomes
    }

    /// Remove this attempt's token from every store that may hold it
    ///
    /// Stores that definitively rejected the set never saw the token and are
    /// skipped. Stores that failed are included, since a timed-out set may
    /// still have landed.
    async fn undo(&self, request: &LockRequest, outcomes: &[SetOutcome]) {
        for (store, outcome) in self.stores.iter().zip(outcomes) {
            if *outcome == SetOutcome::Rejected {
                continue;
            }
            unlock_instance(store.as_ref(), request).await;
        }
    }

    async fn publish(&self, event: LockEvent) {
        if let Some(events) = &self.events
            && let Err(e) = events.publish(&event).await
        {
            warn!(event_type = %event.event_type, error = %e, "Failed to publish lock event");
        }
    }
}

impl std::fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("stores", &self.store_names())
            .field("quorum", &self.quorum)
            .field("config", &self.config)
            .field("events", &self.events.is_some())
            .finish()
    }
}

async fn lock_instance(store: &dyn LockStore, request: &LockRequest) -> SetOutcome {
    match store
        .try_set_if_absent(&request.resource, request.token.as_str(), request.ttl_ms)
        .await
    {
        Ok(true) => SetOutcome::Acquired,
        Ok(false) => {
            debug!(store = store.name(), resource = %request.resource, "Store already holds the key");
            SetOutcome::Rejected
        }
        Err(e) => {
            warn!(store = store.name(), resource = %request.resource, error = %e, "Store unavailable during acquire");
            SetOutcome::Unreachable
        }
    }
}

async fn unlock_instance(store: &dyn LockStore, request: &LockRequest) {
    if let Err(e) = store
        .compare_and_delete(&request.resource, request.token.as_str())
        .await
    {
        debug!(store = store.name(), resource = %request.resource, error = %e, "Undo failed on store");
    }
}

fn tally(outcomes: &[SetOutcome]) -> AttemptTally {
    outcomes
        .iter()
        .fold(AttemptTally::default(), |mut tally, outcome| {
            match outcome {
                SetOutcome::Acquired => tally.acquired += 1,
                SetOutcome::Rejected => tally.rejected += 1,
                SetOutcome::Unreachable => tally.unreachable += 1,
            }
            tally
        })
}

/// Random wait in `[max / 2, max]`, in whole milliseconds
fn jittered_delay(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    let min_ms = max_ms / 2;
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::event::{InMemoryEventStore, LockEventType};
    use crate::store::InMemoryStore;

    fn create_test_stores(n: usize) -> Vec<Arc<InMemoryStore>> {
        (0..n)
            .map(|i| Arc::new(InMemoryStore::new(format!("store-{}", i))))
            .collect()
    }

    fn as_dyn(stores: &[Arc<InMemoryStore>]) -> Vec<Arc<dyn LockStore>> {
        stores
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn LockStore>)
            .collect()
    }

    #[test]
    fn test_jittered_delay_bounds() {
        for _ in 0..100 {
            let delay = jittered_delay(Duration::from_millis(200));
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }
        assert_eq!(jittered_delay(Duration::ZERO), Duration::ZERO);
        assert!(jittered_delay(Duration::from_millis(1)) <= Duration::from_millis(1));
    }

    #[test]
    fn test_tally() {
        let outcomes = [
            SetOutcome::Acquired,
            SetOutcome::Rejected,
            SetOutcome::Unreachable,
            SetOutcome::Acquired,
        ];
        assert_eq!(
            tally(&outcomes),
            AttemptTally {
                acquired: 2,
                rejected: 1,
                unreachable: 1
            }
        );
    }

    #[test]
    fn test_configure_requires_quorum() {
        let stores = create_test_stores(3);
        let err = LockCoordinator::configure(as_dyn(&stores), CoordinatorConfig::default())
            .unwrap_err();
        assert_eq!(err.code(), "E100");

        let err = LockCoordinator::new(as_dyn(&stores), 4).unwrap_err();
        assert_eq!(err.code(), "E101");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_and_release() {
        let stores = create_test_stores(3);
        let coordinator = LockCoordinator::new(as_dyn(&stores), 2).unwrap();

        let handle = coordinator
            .acquire("orders", 1000)
            .await
            .expect("valid arguments")
            .expect("all stores free");

        assert_eq!(handle.resource, "orders");
        assert_eq!(handle.validity_ms, 988);
        for store in &stores {
            assert_eq!(store.get("orders").as_deref(), Some(handle.token.as_str()));
        }

        let report = coordinator.release(&handle).await;
        assert_eq!(report.deleted, 3);
        assert!(stores.iter().all(|s| s.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_arguments_fail_fast() {
        let stores = create_test_stores(1);
        let coordinator = LockCoordinator::new(as_dyn(&stores), 1).unwrap();

        assert!(matches!(
            coordinator.acquire("", 1000).await,
            Err(Error::EmptyResource)
        ));
        assert!(matches!(
            coordinator.acquire("orders", 0).await,
            Err(Error::InvalidTtl(0))
        ));
        assert_eq!(stores[0].set_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_undoes_partial_locks() {
        let stores = create_test_stores(3);
        stores[1].try_set_if_absent("orders", "other", 10_000).await.unwrap();
        stores[2].try_set_if_absent("orders", "other", 10_000).await.unwrap();

        let coordinator = LockCoordinator::configure(
            as_dyn(&stores),
            CoordinatorConfig::new(2).with_retry_count(1),
        )
        .unwrap();

        assert!(coordinator.acquire("orders", 1000).await.unwrap().is_none());

        // The one store that accepted was cleaned up; the rejecting stores
        // were never asked to delete.
        assert!(stores[0].get("orders").is_none());
        assert_eq!(stores[0].delete_calls(), 1);
        assert_eq!(stores[1].delete_calls(), 0);
        assert_eq!(stores[2].get("orders").as_deref(), Some("other"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expended_validity_is_a_failure() {
        let stores = create_test_stores(3);
        for store in &stores {
            store.set_latency(Duration::from_millis(40));
        }
        let coordinator = LockCoordinator::configure(
            as_dyn(&stores),
            CoordinatorConfig::new(2).with_retry_count(1),
        )
        .unwrap();

        // 120ms of store latency leaves nothing of a 100ms TTL
        assert!(coordinator.acquire("orders", 100).await.unwrap().is_none());
        assert!(stores.iter().all(|s| s.get("orders").is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_hands_out_zero_validity() {
        let stores = create_test_stores(1);

        // Drift of 999.5ms leaves half a millisecond of a 1000ms TTL
        let coordinator = LockCoordinator::configure(
            as_dyn(&stores),
            CoordinatorConfig::new(1)
                .with_retry_count(1)
                .with_clock_drift_factor(0.9975),
        )
        .unwrap();
        assert!(coordinator.acquire("orders", 1000).await.unwrap().is_none());
        assert!(stores[0].is_empty());

        // Drift of 998.5ms leaves one whole millisecond
        let coordinator = LockCoordinator::configure(
            as_dyn(&stores),
            CoordinatorConfig::new(1)
                .with_retry_count(1)
                .with_clock_drift_factor(0.9965),
        )
        .unwrap();
        let handle = coordinator.acquire("orders", 1000).await.unwrap().unwrap();
        assert_eq!(handle.validity_ms, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_marks_unreachable_quorum() {
        let stores = create_test_stores(3);
        stores[0].set_reachable(false);
        stores[1].set_reachable(false);

        let coordinator = LockCoordinator::new(as_dyn(&stores), 2).unwrap();
        let outcome = coordinator.acquire_with_report("orders", 1000).await.unwrap();

        match outcome {
            AcquireOutcome::Failed(report) => {
                assert_eq!(report.attempts, 2);
                assert_eq!(report.last_attempt.unreachable, 2);
                assert!(report.quorum_unreachable());
            }
            AcquireOutcome::Acquired(_) => panic!("quorum of 2 cannot be met with 1 store"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_published() {
        let stores = create_test_stores(3);
        let events = Arc::new(InMemoryEventStore::new());
        let coordinator = LockCoordinator::new(as_dyn(&stores), 2)
            .unwrap()
            .with_event_publisher(events.clone());

        let handle = coordinator.acquire("orders", 1000).await.unwrap().unwrap();
        assert!(coordinator.acquire("orders", 1000).await.unwrap().is_none());
        coordinator.release(&handle).await;

        let types: Vec<_> = events
            .events_for("orders")
            .iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                LockEventType::LockAcquired,
                LockEventType::AcquireFailed,
                LockEventType::LockReleased
            ]
        );

        let states: Vec<_> = events
            .all_events()
            .iter()
            .filter_map(|e| e.data.as_ref().map(|d| d["state"].clone()))
            .collect();
        assert_eq!(states, vec!["held", "unacquired", "released"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_releases_afterwards() {
        let stores = create_test_stores(3);
        let coordinator = LockCoordinator::new(as_dyn(&stores), 2).unwrap();

        let seen = coordinator
            .with_lock("orders", 1000, |handle| async move {
                assert!(!handle.is_expired());
                handle.resource
            })
            .await
            .unwrap();

        assert_eq!(seen.as_deref(), Some("orders"));
        assert!(stores.iter().all(|s| s.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_skips_when_busy() {
        let stores = create_test_stores(1);
        stores[0].try_set_if_absent("orders", "other", 10_000).await.unwrap();
        let coordinator = LockCoordinator::new(as_dyn(&stores), 1).unwrap();

        let ran = coordinator
            .with_lock("orders", 1000, |_| async { true })
            .await
            .unwrap();
        assert!(ran.is_none());
    }
}
