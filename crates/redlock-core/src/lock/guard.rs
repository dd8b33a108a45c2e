//! Lock guards for scoped lock management
//!
//! A guard releases its lock when dropped. Dropping cannot await, so the
//! release is spawned onto the current tokio runtime; outside a runtime the
//! stores expire the lock on their own once the TTL runs out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::coordinator::LockCoordinator;
use super::types::{LockHandle, LockState, ReleaseReport};

/// A held lock that is released when dropped
pub struct LockGuard {
    /// Coordinator that acquired the lock
    coordinator: Arc<LockCoordinator>,

    /// Handle presented on release
    handle: LockHandle,

    /// Monotonic end of the validity window
    deadline: Instant,

    /// Whether the lock has been explicitly released
    released: bool,
}

impl LockGuard {
    /// Create a new lock guard
    pub(crate) fn new(coordinator: Arc<LockCoordinator>, handle: LockHandle) -> Self {
        let deadline = Instant::now() + handle.validity();
        Self {
            coordinator,
            handle,
            deadline,
            released: false,
        }
    }

    /// Get the lock handle
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    /// Get the locked resource
    pub fn resource(&self) -> &str {
        &self.handle.resource
    }

    /// Validity left before the lock must be treated as lost
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Check if the lock is still held and inside its validity window
    pub fn is_valid(&self) -> bool {
        self.state() == LockState::Held
    }

    /// Current lifecycle state
    pub fn state(&self) -> LockState {
        if self.released {
            LockState::Released
        } else if Instant::now() >= self.deadline {
            LockState::Expired
        } else {
            LockState::Held
        }
    }

    /// Explicitly release the lock and wait for every store to answer
    pub async fn release(mut self) -> ReleaseReport {
        self.released = true;
        self.coordinator.release(&self.handle).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let coordinator = Arc::clone(&self.coordinator);
                let handle = self.handle.clone();
                runtime.spawn(async move {
                    coordinator.release(&handle).await;
                });
            }
            Err(_) => {
                debug!(resource = %self.handle.resource, "No runtime on drop, lock left to expire");
            }
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("handle", &self.handle)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockGuard[{}]", self.handle.resource)
    }
}
