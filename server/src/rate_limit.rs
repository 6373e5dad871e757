//! Per-credential hourly quotas using the token bucket algorithm.
//!
//! Every credential carries a `rate_limit`: the number of inbound actions it
//! may perform per hour. The hub keeps one token bucket per credential,
//! keyed by the credential's key digest, so all connections sharing a key
//! also share its quota.
//!
//! # Algorithm
//!
//! - A bucket holds up to `quota` tokens and starts full
//! - Tokens are added at `quota / 3600` per second
//! - Each routed action consumes one token
//! - A quota of zero means unlimited and never creates a bucket
//!
//! # Example
//!
//! ```rust
//! use mainframe_hub::rate_limit::{RateLimiter, RateLimitResult};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::new();
//!
//!     assert_eq!(limiter.check_quota("digest", 1).await, RateLimitResult::Allowed);
//!     assert!(limiter.check_quota("digest", 1).await.is_limited());
//!
//!     // Unlimited credentials are never tracked.
//!     assert!(limiter.check_quota("other", 0).await.is_allowed());
//!     assert_eq!(limiter.tracked_keys().await, 1);
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// Seconds over which a quota replenishes.
pub const QUOTA_WINDOW_SECS: f64 = 3600.0;

/// Buckets idle for this long are dropped (one full quota window).
pub const STALE_ENTRY_TIMEOUT: Duration = Duration::from_secs(3600);

/// Result of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// The action may proceed.
    Allowed,

    /// The quota is exhausted.
    Limited {
        /// Seconds until the next token is available.
        retry_after_secs: u64,
    },
}

impl RateLimitResult {
    /// Returns `true` if the action is allowed.
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Returns `true` if the action is rate limited.
    #[inline]
    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited { .. })
    }

    /// Returns the retry-after duration if rate limited, or `None` if allowed.
    #[inline]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Allowed => None,
            Self::Limited { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

/// A token bucket for one credential.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    capacity: u32,
    /// Tokens per second.
    rate: f64,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: Instant::now(),
            capacity,
            rate,
        }
    }

    /// Creates a bucket for an hourly quota.
    pub fn for_hourly_quota(per_hour: u32) -> Self {
        Self::new(f64::from(per_hour) / QUOTA_WINDOW_SECS, per_hour)
    }

    /// Refills, then tries to take one token.
    pub fn try_consume(&mut self) -> RateLimitResult {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateLimitResult::Allowed;
        }

        let tokens_needed = 1.0 - self.tokens;
        let retry_after_secs = (tokens_needed / self.rate).ceil() as u64;
        RateLimitResult::Limited {
            retry_after_secs: retry_after_secs.max(1),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_secs = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed_secs * self.rate).min(f64::from(self.capacity));
        self.last_refill = now;
    }

    /// Time since the bucket was last touched.
    pub fn idle_for(&self) -> Duration {
        self.last_refill.elapsed()
    }

    #[cfg(test)]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Thread-safe per-credential quota tracker.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    buckets: Arc<RwLock<HashMap<String, TokenBucket>>>,
}

impl RateLimiter {
    /// Creates an empty limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one unit of `key`'s hourly quota of `per_hour` actions.
    ///
    /// `per_hour == 0` is unlimited.
    pub async fn check_quota(&self, key: &str, per_hour: u32) -> RateLimitResult {
        if per_hour == 0 {
            return RateLimitResult::Allowed;
        }

        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::for_hourly_quota(per_hour));

        bucket.try_consume()
    }

    /// Removes buckets idle for longer than [`STALE_ENTRY_TIMEOUT`].
    pub async fn sweep_idle(&self) -> usize {
        self.sweep_idle_older_than(STALE_ENTRY_TIMEOUT).await
    }

    /// Removes buckets idle for longer than `timeout`.
    pub async fn sweep_idle_older_than(&self, timeout: Duration) -> usize {
        let mut buckets = self.buckets.write().await;
        let initial_count = buckets.len();

        buckets.retain(|_, bucket| bucket.idle_for() < timeout);

        initial_count - buckets.len()
    }

    /// Number of tracked credentials.
    pub async fn tracked_keys(&self) -> usize {
        self.buckets.read().await.len()
    }

    /// Spawns a task that sweeps stale buckets every `cleanup_interval`.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use mainframe_hub::rate_limit::RateLimiter;
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let limiter = RateLimiter::new();
    ///     let _cleanup_handle = limiter.spawn_cleanup_task(Duration::from_secs(30));
    /// }
    /// ```
    pub fn spawn_cleanup_task(&self, cleanup_interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                interval.tick().await;
                let removed = limiter.sweep_idle().await;
                if removed > 0 {
                    tracing::debug!(removed_count = removed, "Swept idle quota buckets");
                }
            }
        })
    }
}
