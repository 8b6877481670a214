use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub webhooks_received: u64,
    pub webhooks_rejected: u64,
    pub events_dispatched: u64,
    pub events_failed: u64,
    pub codes_sent: u64,
    pub rate_limited: u64,
}

#[derive(Debug)]
pub struct MetricsStore {
    start_time: Instant,
    webhooks_received: AtomicU64,
    webhooks_rejected: AtomicU64,
    events_dispatched: AtomicU64,
    events_failed: AtomicU64,
    codes_sent: AtomicU64,
    rate_limited: AtomicU64,
}

impl MetricsStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            webhooks_received: AtomicU64::new(0),
            webhooks_rejected: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            codes_sent: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
        })
    }

    pub fn inc_webhooks_received(&self) {
        self.webhooks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhooks_rejected(&self) {
        self.webhooks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_events(&self, dispatched: u64, failed: u64) {
        self.events_dispatched.fetch_add(dispatched, Ordering::Relaxed);
        self.events_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn inc_codes_sent(&self) {
        self.codes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            webhooks_received: self.webhooks_received.load(Ordering::Relaxed),
            webhooks_rejected: self.webhooks_rejected.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            codes_sent: self.codes_sent.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}
