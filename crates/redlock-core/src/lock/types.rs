//! Lock types and coordinator configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result, majority};

/// Default number of acquisition attempts
pub const DEFAULT_RETRY_COUNT: u32 = 2;

/// Default upper bound of the randomized wait between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Default fraction of the TTL reserved for clock drift
pub const DEFAULT_CLOCK_DRIFT_FACTOR: f64 = 0.01;

/// Fixed drift allowance in milliseconds: 1ms of store expiry precision plus
/// 1ms minimum drift for small TTLs
pub const BASE_DRIFT_MS: f64 = 2.0;

/// Ownership token for one acquisition attempt
///
/// Formatted `host:pid:uuid`. Only uniqueness matters; the random part makes
/// collisions between concurrent acquirers vanishingly unlikely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a fresh token for this host and process
    pub fn generate() -> Self {
        Self(format!(
            "{}:{}:{}",
            host_name(),
            std::process::id(),
            Uuid::new_v4().simple()
        ))
    }

    /// Token as stored in the lock stores
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for LockToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn host_name() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| gethostname::gethostname().to_string_lossy().into_owned())
}

/// One acquisition attempt
///
/// Lives for a single pass over the stores and is never persisted.
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// Contested resource, used as the store key
    pub resource: String,
    /// Requested validity in milliseconds
    pub ttl_ms: u64,
    /// Token written to every store
    pub token: LockToken,
}

impl LockRequest {
    /// Create a request with a freshly generated token
    pub fn new(resource: &str, ttl_ms: u64) -> Self {
        Self {
            resource: resource.to_string(),
            ttl_ms,
            token: LockToken::generate(),
        }
    }

    /// Drift reserved for this request: `ttl * factor + 2ms`
    pub fn drift_ms(&self, clock_drift_factor: f64) -> f64 {
        self.ttl_ms as f64 * clock_drift_factor + BASE_DRIFT_MS
    }

    /// Remaining validity after `elapsed` in whole milliseconds, or `None`
    /// once less than a millisecond is left
    pub fn validity(&self, elapsed: Duration, clock_drift_factor: f64) -> Option<Duration> {
        let elapsed_ms = elapsed.as_micros() as f64 / 1000.0;
        let validity_ms =
            (self.ttl_ms as f64 - elapsed_ms - self.drift_ms(clock_drift_factor)).floor();

        if validity_ms >= 1.0 {
            Some(Duration::from_millis(validity_ms as u64))
        } else {
            None
        }
    }
}

/// A successfully acquired lock
///
/// Carries no connection. Present it back to
/// [`LockCoordinator::release`](super::LockCoordinator::release) to give the
/// lock up early; otherwise the stores expire it on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHandle {
    /// Locked resource
    pub resource: String,
    /// Ownership token held in the stores
    pub token: LockToken,
    /// Estimated validity at acquisition, net of elapsed time and drift
    pub validity_ms: u64,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
    /// When the validity window closes
    pub expires_at: DateTime<Utc>,
}

impl LockHandle {
    pub(crate) fn new(request: LockRequest, validity: Duration) -> Self {
        let now = Utc::now();
        Self {
            resource: request.resource,
            token: request.token,
            validity_ms: validity.as_millis() as u64,
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(validity).unwrap_or_default(),
        }
    }

    /// Handle for releasing a lock known only by resource and token
    pub fn for_release(resource: impl Into<String>, token: impl Into<LockToken>) -> Self {
        let now = Utc::now();
        Self {
            resource: resource.into(),
            token: token.into(),
            validity_ms: 0,
            acquired_at: now,
            expires_at: now,
        }
    }

    /// Validity window at acquisition
    pub fn validity(&self) -> Duration {
        Duration::from_millis(self.validity_ms)
    }

    /// Check if the validity window has closed
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl fmt::Display for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock[{} valid {}ms]", self.resource, self.validity_ms)
    }
}

/// Lifecycle of a lock as seen by its holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// No lock held
    Unacquired,
    /// An acquisition pass is running
    Attempting,
    /// Quorum reached and validity remaining
    Held,
    /// Released by the holder
    Released,
    /// Validity window closed without a release
    Expired,
}

impl LockState {
    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Expired)
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unacquired => write!(f, "unacquired"),
            Self::Attempting => write!(f, "attempting"),
            Self::Held => write!(f, "held"),
            Self::Released => write!(f, "released"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Per-store results of one acquisition attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptTally {
    /// Stores that accepted the conditional set
    pub acquired: usize,
    /// Stores that already held the key
    pub rejected: usize,
    /// Stores that failed or timed out
    pub unreachable: usize,
}

/// Why an acquisition gave up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireReport {
    /// Resource that was contested
    pub resource: String,
    /// Attempts made
    pub attempts: u32,
    /// Quorum that had to be reached
    pub quorum: usize,
    /// Store results of the final attempt
    pub last_attempt: AttemptTally,
}

impl AcquireReport {
    /// Whether enough stores were unreachable that quorum was impossible
    ///
    /// Distinguishes a broken deployment from a busy lock.
    pub fn quorum_unreachable(&self) -> bool {
        let stores =
            self.last_attempt.acquired + self.last_attempt.rejected + self.last_attempt.unreachable;
        stores - self.last_attempt.unreachable < self.quorum
    }
}

/// Result of an acquisition with its diagnostics
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// Lock held
    Acquired(LockHandle),
    /// All attempts used up
    Failed(AcquireReport),
}

impl AcquireOutcome {
    /// The handle, if acquired
    pub fn into_handle(self) -> Option<LockHandle> {
        match self {
            Self::Acquired(handle) => Some(handle),
            Self::Failed(_) => None,
        }
    }
}

/// Per-store results of a release
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReport {
    /// Stores where the key was deleted
    pub deleted: usize,
    /// Stores where the key was absent or owned by another token
    pub not_held: usize,
    /// Stores that failed or timed out
    pub unreachable: usize,
}

/// Configuration for the lock coordinator
///
/// Set once before the coordinator is built; read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Minimum number of stores that must accept a lock. No default.
    pub quorum: Option<usize>,

    /// Maximum number of acquisition attempts
    pub retry_count: u32,

    /// Upper bound of the randomized wait between attempts
    pub retry_delay: Duration,

    /// Fraction of the TTL reserved for clock drift
    pub clock_drift_factor: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            quorum: None,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            clock_drift_factor: DEFAULT_CLOCK_DRIFT_FACTOR,
        }
    }
}

impl CoordinatorConfig {
    /// Create a config with an explicit quorum and default tuning
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum: Some(quorum),
            ..Self::default()
        }
    }

    /// Set the maximum number of attempts
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the upper bound of the inter-attempt wait
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Set the clock drift factor
    pub fn with_clock_drift_factor(mut self, clock_drift_factor: f64) -> Self {
        self.clock_drift_factor = clock_drift_factor;
        self
    }

    /// Check the config against `stores` stores and return the quorum
    pub fn validate(&self, stores: usize) -> Result<usize> {
        if stores == 0 {
            return Err(Error::NoStores);
        }

        let quorum = match self.quorum {
            Some(q) if q >= 1 => q,
            _ => {
                return Err(Error::QuorumUnset {
                    stores,
                    suggested: majority(stores),
                });
            }
        };
        if quorum > stores {
            return Err(Error::QuorumExceedsStores { quorum, stores });
        }

        if self.retry_count == 0 {
            return Err(Error::InvalidRetryCount(self.retry_count));
        }
        if !self.clock_drift_factor.is_finite() || !(0.0..1.0).contains(&self.clock_drift_factor) {
            return Err(Error::InvalidDriftFactor(self.clock_drift_factor));
        }

        Ok(quorum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_uniqueness() {
        let a = LockToken::generate();
        let b = LockToken::generate();

        assert_ne!(a, b);
        assert!(a.as_str().starts_with(host_name()));
        assert!(a.as_str().contains(&format!(":{}:", std::process::id())));
    }

    #[test]
    fn test_drift_and_validity() {
        let request = LockRequest::new("orders", 1000);

        assert_eq!(request.drift_ms(0.01), 12.0);
        assert_eq!(
            request.validity(Duration::from_millis(50), 0.01),
            Some(Duration::from_millis(938))
        );
        assert_eq!(request.validity(Duration::from_millis(988), 0.01), None);
    }

    #[test]
    fn test_small_ttl_has_no_validity() {
        let request = LockRequest::new("orders", 2);
        assert_eq!(request.validity(Duration::ZERO, 0.01), None);
    }

    #[test]
    fn test_sub_millisecond_validity_is_none() {
        let request = LockRequest::new("orders", 1000);

        // 997.5ms + 2ms of drift leaves half a millisecond
        assert_eq!(request.validity(Duration::ZERO, 0.9975), None);
        assert_eq!(request.validity(Duration::from_micros(400), 0.9965), Some(Duration::from_millis(1)));
        assert_eq!(request.validity(Duration::from_micros(1_600), 0.9965), None);
    }

    #[test]
    fn test_handle_serialization() {
        let request = LockRequest::new("orders", 1000);
        let handle = LockHandle::new(request, Duration::from_millis(900));

        let json = serde_json::to_string(&handle).unwrap();
        let parsed: LockHandle = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, handle);
        assert_eq!(parsed.validity(), Duration::from_millis(900));
        assert!(!parsed.is_expired());
    }

    #[test]
    fn test_release_handle_is_expired() {
        let handle = LockHandle::for_release("orders", "host:1:abc");
        assert_eq!(handle.token.as_str(), "host:1:abc");
        assert!(handle.is_expired());
    }

    #[test]
    fn test_lock_state_display() {
        assert_eq!(LockState::Held.to_string(), "held");
        assert_eq!(LockState::Expired.to_string(), "expired");
        assert!(LockState::Released.is_terminal());
        assert!(!LockState::Attempting.is_terminal());
        assert_eq!(
            serde_json::to_value(LockState::Unacquired).unwrap(),
            serde_json::json!("unacquired")
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = CoordinatorConfig::default();

        assert_eq!(config.quorum, None);
        assert_eq!(config.retry_count, 2);
        assert_eq!(config.retry_delay, Duration::from_millis(200));
        assert_eq!(config.clock_drift_factor, 0.01);
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(
            CoordinatorConfig::default().validate(3),
            Err(Error::QuorumUnset { suggested: 2, .. })
        ));
        assert!(matches!(
            CoordinatorConfig::new(4).validate(3),
            Err(Error::QuorumExceedsStores { .. })
        ));
        assert!(matches!(
            CoordinatorConfig::new(1).validate(0),
            Err(Error::NoStores)
        ));
        assert!(matches!(
            CoordinatorConfig::new(2).with_retry_count(0).validate(3),
            Err(Error::InvalidRetryCount(0))
        ));
        assert!(matches!(
            CoordinatorConfig::new(2)
                .with_clock_drift_factor(1.5)
                .validate(3),
            Err(Error::InvalidDriftFactor(_))
        ));
        assert_eq!(CoordinatorConfig::new(2).validate(3).unwrap(), 2);
    }

    #[test]
    fn test_report_distinguishes_busy_from_broken() {
        let busy = AcquireReport {
            resource: "r".to_string(),
            attempts: 2,
            quorum: 2,
            last_attempt: AttemptTally {
                acquired: 1,
                rejected: 2,
                unreachable: 0,
            },
        };
        assert!(!busy.quorum_unreachable());

        let broken = AcquireReport {
            last_attempt: AttemptTally {
                acquired: 1,
                rejected: 0,
                unreachable: 2,
            },
            ..busy
        };
        assert!(broken.quorum_unreachable());
    }
}
