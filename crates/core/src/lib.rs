pub mod audit;
pub mod config;
pub mod metrics;
pub mod secrets;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
