//! Time-windowed attempt counting for phone verification sends.
//!
//! Each key (a normalized phone number) gets a fixed window that starts at its
//! first attempt. Once `max_attempts` have been recorded inside the window,
//! further checks are denied until the window elapses.

pub mod clock;
pub mod phone;
pub mod store;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

pub use clock::{Clock, ManualClock, SystemClock};
pub use phone::{normalize_phone, PhoneError};
pub use store::{AttemptRecord, AttemptStore, InMemoryAttemptStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            window,
        }
    }

    /// Window length in milliseconds, saturating at `i64::MAX`.
    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(15 * 60))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
        }
    }

    pub fn deny(retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs: Some(retry_after_secs),
        }
    }
}

/// Rate limiter over an injected [`AttemptStore`] and [`Clock`].
pub struct RateLimiter {
    store: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn AttemptStore>, clock: Arc<dyn Clock>, policy: RateLimitPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    /// In-memory store on the system clock.
    pub fn in_memory(policy: RateLimitPolicy) -> Self {
        Self::new(
            Arc::new(InMemoryAttemptStore::new()),
            Arc::new(SystemClock),
            policy,
        )
    }

    pub async fn check_send_rate_limit(&self, key: &str) -> RateLimitDecision {
        self.store
            .check(key, &self.policy, self.clock.now_ms())
            .await
    }

    pub async fn record_attempt(&self, key: &str) {
        self.store
            .record(key, &self.policy, self.clock.now_ms())
            .await
    }

    /// Check and, when allowed, record in one step so two concurrent sends
    /// for the same key cannot both slip under the limit.
    pub async fn check_and_record(&self, key: &str) -> RateLimitDecision {
        self.store
            .check_and_record(key, &self.policy, self.clock.now_ms())
            .await
    }

    pub async fn sweep_expired(&self) -> usize {
        self.store.sweep(&self.policy, self.clock.now_ms()).await
    }

    pub async fn tracked_keys(&self) -> usize {
        self.store.len().await
    }

    /// Start the periodic sweep on its own task.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> SweepHandle {
        let limiter = Arc::clone(self);
        let every = every.max(Duration::from_secs(1));
        info!("Rate limit sweeper started (interval: {:?})", every);

        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                let removed = limiter.sweep_expired().await;
                if removed > 0 {
                    debug!(removed, "Swept expired rate limit records");
                }
            }
        });

        SweepHandle { task }
    }
}

/// Owns the sweep task; dropping or calling [`SweepHandle::shutdown`] stops it.
pub struct SweepHandle {
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub fn shutdown(self) {
        drop(self);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
