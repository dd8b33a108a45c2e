//! Property tests for quorum arithmetic and partial-store tolerance

use proptest::prelude::*;
use redlock_core::error::majority;
use redlock_core::lock::{CoordinatorConfig, LockCoordinator, LockRequest};
use redlock_core::store::{InMemoryStore, LockStore};
use std::sync::Arc;
use std::time::Duration;

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("failed to build runtime")
}

proptest! {
    #[test]
    fn majority_quorums_always_intersect(n in 1usize..64) {
        let q = majority(n);
        prop_assert!(q <= n);
        // Two disjoint sets of q stores would need 2q stores
        prop_assert!(2 * q > n);
    }

    #[test]
    fn validity_never_positive_past_ttl(ttl in 1u64..100_000, elapsed in 0u64..200_000, factor in 0.0f64..0.5) {
        let request = LockRequest::new("r", ttl);
        let validity = request.validity(Duration::from_millis(elapsed), factor);

        if elapsed >= ttl {
            prop_assert!(validity.is_none());
        }
        if let Some(validity) = validity {
            prop_assert!(validity.as_millis() > 0);
            prop_assert_eq!(validity, Duration::from_millis(validity.as_millis() as u64));
            prop_assert!(validity.as_millis() as u64 + elapsed < ttl);
        }
    }

    #[test]
    fn acquires_iff_reachable_majority(n in 1usize..8, down_mask in any::<u8>()) {
        let runtime = paused_runtime();
        let stores: Vec<Arc<InMemoryStore>> = (0..n)
            .map(|i| {
                let store = InMemoryStore::new(format!("s{}", i));
                store.set_reachable(down_mask & (1 << i) == 0);
                Arc::new(store)
            })
            .collect();
        let reachable = stores.iter().filter(|s| s.is_reachable()).count();

        let dyn_stores = stores
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn LockStore>)
            .collect();
        let coordinator = LockCoordinator::configure(
            dyn_stores,
            CoordinatorConfig::new(majority(n)).with_retry_count(1),
        )
        .unwrap();

        let handle = runtime.block_on(coordinator.acquire("resource", 1_000)).unwrap();

        prop_assert_eq!(handle.is_some(), reachable >= majority(n));
        if handle.is_none() {
            prop_assert!(stores.iter().all(|s| s.is_empty()));
        }
    }
}
