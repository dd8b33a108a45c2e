//! Lock events
//!
//! Events for tracking acquisitions, failed acquisitions and releases. The
//! coordinator publishes them when an [`EventPublisher`] is attached.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

use super::types::{AcquireReport, LockHandle, LockState, ReleaseReport};
use crate::error::Result;

/// Type of lock event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventType {
    /// Quorum reached and a handle returned
    LockAcquired,
    /// Every attempt failed to reach quorum
    AcquireFailed,
    /// A handle was released
    LockReleased,
}

impl LockEventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LockAcquired => "lock_acquired",
            Self::AcquireFailed => "acquire_failed",
            Self::LockReleased => "lock_released",
        }
    }
}

impl std::fmt::Display for LockEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A lock event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEvent {
    /// Unique event identifier
    pub id: Uuid,
    /// Resource the event is about
    pub resource: String,
    /// Type of event
    pub event_type: LockEventType,
    /// Event data
    pub data: Option<serde_json::Value>,
    /// When the event occurred
    pub created_at: DateTime<Utc>,
}

impl LockEvent {
    /// Create a new lock event
    pub fn new(resource: &str, event_type: LockEventType, data: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource: resource.to_string(),
            event_type,
            data,
            created_at: Utc::now(),
        }
    }

    /// Create a lock acquired event
    pub fn lock_acquired(handle: &LockHandle, acquired_stores: usize, attempt: u32) -> Self {
        let data = serde_json::json!({
            "token": handle.token.as_str(),
            "state": LockState::Held,
            "validity_ms": handle.validity_ms,
            "acquired_stores": acquired_stores,
            "attempt": attempt,
        });
        Self::new(&handle.resource, LockEventType::LockAcquired, Some(data))
    }

    /// Create an acquire failed event
    pub fn acquire_failed(report: &AcquireReport) -> Self {
        let data = serde_json::json!({
            "state": LockState::Unacquired,
            "attempts": report.attempts,
            "quorum": report.quorum,
            "acquired": report.last_attempt.acquired,
            "rejected": report.last_attempt.rejected,
            "unreachable": report.last_attempt.unreachable,
        });
        Self::new(&report.resource, LockEventType::AcquireFailed, Some(data))
    }

    /// Create a lock released event
    pub fn lock_released(handle: &LockHandle, report: &ReleaseReport) -> Self {
        let data = serde_json::json!({
            "token": handle.token.as_str(),
            "state": LockState::Released,
            "deleted": report.deleted,
            "not_held": report.not_held,
            "unreachable": report.unreachable,
        });
        Self::new(&handle.resource, LockEventType::LockReleased, Some(data))
    }
}

/// Publisher for lock events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a lock event
    async fn publish(&self, event: &LockEvent) -> Result<()>;
}

/// A simple in-memory event store for recording events
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<LockEvent>>,
}

impl InMemoryEventStore {
    /// Create a new in-memory event store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get events for a resource
    pub fn events_for(&self, resource: &str) -> Vec<LockEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.resource == resource)
            .cloned()
            .collect()
    }

    /// Get events by type
    pub fn events_by_type(&self, event_type: LockEventType) -> Vec<LockEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Get all events
    pub fn all_events(&self) -> Vec<LockEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clear all events
    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventStore {
    async fn publish(&self, event: &LockEvent) -> Result<()> {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}
