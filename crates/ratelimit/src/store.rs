use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::{RateLimitDecision, RateLimitPolicy};

/// Attempts seen for one key inside its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub count: u32,
    pub first_attempt_ms: i64,
    pub last_attempt_ms: i64,
}

impl AttemptRecord {
    pub fn first(now_ms: i64) -> Self {
        Self {
            count: 1,
            first_attempt_ms: now_ms,
            last_attempt_ms: now_ms,
        }
    }

    /// The window runs from the first attempt; it is over once a full window has elapsed.
    pub fn window_expired(&self, policy: &RateLimitPolicy, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.first_attempt_ms) >= policy.window_ms()
    }

    pub fn is_stale(&self, policy: &RateLimitPolicy, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_attempt_ms) >= policy.window_ms()
    }

    /// Decide for a live (unexpired) record.
    pub fn decide(&self, policy: &RateLimitPolicy, now_ms: i64) -> RateLimitDecision {
        if self.count < policy.max_attempts {
            return RateLimitDecision::allow();
        }
        let remaining_ms = self
            .first_attempt_ms
            .saturating_add(policy.window_ms())
            .saturating_sub(now_ms)
            .max(1);
        let secs = remaining_ms / 1000 + i64::from(remaining_ms % 1000 != 0);
        RateLimitDecision::deny(secs as u64)
    }

    /// Count one more attempt. `count` is capped at the policy maximum and
    /// `last_attempt_ms` never moves behind `first_attempt_ms`.
    pub fn bump(&mut self, policy: &RateLimitPolicy, now_ms: i64) {
        if self.count < policy.max_attempts {
            self.count += 1;
        }
        self.last_attempt_ms = now_ms.max(self.last_attempt_ms);
    }
}

/// Backing store for attempt records. The in-memory map is the default;
/// a shared cache can implement the same trait for multi-process deployments.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn check(&self, key: &str, policy: &RateLimitPolicy, now_ms: i64) -> RateLimitDecision;

    async fn record(&self, key: &str, policy: &RateLimitPolicy, now_ms: i64);

    async fn check_and_record(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now_ms: i64,
    ) -> RateLimitDecision;

    /// Remove records whose last attempt predates the window. Returns how many were removed.
    async fn sweep(&self, policy: &RateLimitPolicy, now_ms: i64) -> usize;

    async fn get(&self, key: &str) -> Option<AttemptRecord>;

    async fn len(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct InMemoryAttemptStore {
    records: Mutex<HashMap<String, AttemptRecord>>,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_locked(
    records: &mut HashMap<String, AttemptRecord>,
    key: &str,
    policy: &RateLimitPolicy,
    now_ms: i64,
) -> RateLimitDecision {
    let Some(record) = records.get(key) else {
        return RateLimitDecision::allow();
    };
    if record.window_expired(policy, now_ms) {
        records.remove(key);
        return RateLimitDecision::allow();
    }
    record.decide(policy, now_ms)
}

fn record_locked(
    records: &mut HashMap<String, AttemptRecord>,
    key: &str,
    policy: &RateLimitPolicy,
    now_ms: i64,
) {
    if let Some(record) = records.get_mut(key) {
        if !record.window_expired(policy, now_ms) {
            record.bump(policy, now_ms);
            return;
        }
    }
    records.insert(key.to_string(), AttemptRecord::first(now_ms));
}

#[async_trait]
impl AttemptStore for InMemoryAttemptStore {
    async fn check(&self, key: &str, policy: &RateLimitPolicy, now_ms: i64) -> RateLimitDecision {
        let mut records = self.records.lock().await;
        check_locked(&mut records, key, policy, now_ms)
    }

    async fn record(&self, key: &str, policy: &RateLimitPolicy, now_ms: i64) {
        let mut records = self.records.lock().await;
        record_locked(&mut records, key, policy, now_ms);
    }

    async fn check_and_record(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now_ms: i64,
    ) -> RateLimitDecision {
        let mut records = self.records.lock().await;
        let decision = check_locked(&mut records, key, policy, now_ms);
        if decision.allowed {
            record_locked(&mut records, key, policy, now_ms);
        }
        decision
    }

    async fn sweep(&self, policy: &RateLimitPolicy, now_ms: i64) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_stale(policy, now_ms));
        before - records.len()
    }

    async fn get(&self, key: &str) -> Option<AttemptRecord> {
        self.records.lock().await.get(key).copied()
    }

    async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}
