//! Error types for Redlock

use thiserror::Error;

/// Result type alias using Redlock's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for a single lock store primitive
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Redlock error types
///
/// Only usage and configuration problems are errors. Failing to reach quorum
/// is an ordinary outcome and is reported through `Ok(None)` instead.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (E100-E199)
    #[error("Quorum is not set. Configure it explicitly, typically to {suggested} for {stores} stores.")]
    QuorumUnset { stores: usize, suggested: usize },

    #[error("Quorum {quorum} exceeds the number of configured stores ({stores}).")]
    QuorumExceedsStores { quorum: usize, stores: usize },

    #[error("No lock stores configured. Add at least one `[[stores]]` entry.")]
    NoStores,

    #[error("Retry count must be at least 1, got {0}")]
    InvalidRetryCount(u32),

    #[error("Clock drift factor must be within [0, 1), got {0}")]
    InvalidDriftFactor(f64),

    // Call errors (E200-E299)
    #[error("Lock TTL must be positive, got {0}ms")]
    InvalidTtl(u64),

    #[error("Lock resource name must not be empty")]
    EmptyResource,

    // Store errors (E300-E399)
    #[error("Unsupported store URL '{0}'. Use memory://<name> or redis://<host>:<port>.")]
    UnsupportedStore(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    // Config file errors (E400-E499)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuorumUnset { .. } => "E100",
            Self::QuorumExceedsStores { .. } => "E101",
            Self::NoStores => "E102",
            Self::InvalidRetryCount(_) => "E103",
            Self::InvalidDriftFactor(_) => "E104",
            Self::InvalidTtl(_) => "E200",
            Self::EmptyResource => "E201",
            Self::UnsupportedStore(_) => "E300",
            Self::Store(_) => "E301",
            Self::Config(_) => "E400",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::QuorumUnset { suggested, .. } => {
                Some(format!("redlock config set lock.quorum {}", suggested))
            }
            Self::QuorumExceedsStores { stores, .. } => {
                Some(format!("redlock config set lock.quorum {}", stores / 2 + 1))
            }
            Self::NoStores => Some("redlock stores".to_string()),
            Self::InvalidRetryCount(_) => Some("redlock config set lock.retry_count 2".to_string()),
            _ => None,
        }
    }
}

/// Failure of a single store primitive
///
/// These never reach callers of the coordinator; each one is counted as a
/// non-success for the store that produced it.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Store could not be reached
    #[error("Store '{store}' unreachable: {reason}")]
    Unreachable { store: String, reason: String },

    /// Store did not answer within its operation timeout
    #[error("Store '{store}' timed out after {timeout_ms}ms")]
    Timeout { store: String, timeout_ms: u64 },

    /// Store answered with an error
    #[error("Store '{store}' error: {reason}")]
    Backend { store: String, reason: String },
}

impl StoreError {
    /// Name of the store that failed
    pub fn store(&self) -> &str {
        match self {
            Self::Unreachable { store, .. }
            | Self::Timeout { store, .. }
            | Self::Backend { store, .. } => store,
        }
    }
}

/// Majority quorum for `stores` independent stores
pub fn majority(stores: usize) -> usize {
    stores / 2 + 1
}
