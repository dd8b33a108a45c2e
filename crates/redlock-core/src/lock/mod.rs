//! Quorum locking across independent stores
//!
//! This module provides a Redlock-style distributed mutual-exclusion lock.
//! A lock is held when a majority of independent stores accepted the same
//! token and enough of the TTL is left after accounting for elapsed time and
//! clock drift.
//!
//! # Architecture
//!
//! - **Coordinator**: `LockCoordinator` runs the acquire and release protocol
//! - **Handles**: `LockHandle` is the caller-owned proof of ownership
//! - **Guards**: `LockGuard` releases automatically when dropped
//! - **Events**: `LockEvent` records acquisitions, failures and releases
//!
//! # Guarantees
//!
//! Mutual exclusion is best-effort: it holds while a majority of stores is
//! reachable and store clocks drift by less than the configured fraction of
//! the TTL. There is no lock extension; treat `validity_ms` as a hard
//! deadline and re-acquire if more time is needed.
//!
//! # Example
//!
//! ```ignore
//! use redlock_core::lock::LockCoordinator;
//! use redlock_core::store::open_store;
//!
//! let stores = vec![
//!     open_store("redis://10.0.0.1:6379", timeout)?,
//!     open_store("redis://10.0.0.2:6379", timeout)?,
//!     open_store("redis://10.0.0.3:6379", timeout)?,
//! ];
//! let coordinator = LockCoordinator::new(stores, 2)?;
//!
//! if let Some(handle) = coordinator.acquire("invoice:42", 10_000).await? {
//!     // Do work while handle.validity_ms lasts...
//!     coordinator.release(&handle).await;
//! }
//! ```

pub mod coordinator;
pub mod event;
pub mod guard;
pub mod types;

// Re-export main types
pub use coordinator::LockCoordinator;
pub use event::{EventPublisher, InMemoryEventStore, LockEvent, LockEventType};
pub use guard::LockGuard;
pub use types::{
    AcquireOutcome, AcquireReport, AttemptTally, CoordinatorConfig, LockHandle, LockRequest,
    LockState, LockToken, ReleaseReport,
};
