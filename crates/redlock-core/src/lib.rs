//! Redlock Core Library
//!
//! This crate provides a quorum-based distributed lock, including:
//! - Lock coordinator (acquire, release, scoped guards)
//! - Lock store capability with in-memory and Redis backends
//! - Lock events for auditing acquisitions and releases
//! - File-backed configuration

pub mod config;
pub mod error;
pub mod lock;
pub mod store;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::lock::{LockCoordinator, LockGuard, LockHandle};
    pub use crate::store::{InMemoryStore, LockStore, open_store};
}
