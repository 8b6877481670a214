use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::now_ms_epoch;

/// Target that the CLI routes to the rolling `audit.jsonl` file.
pub const AUDIT_TARGET: &str = "audit";

#[derive(Serialize)]
pub struct AuditEvent {
    pub timestamp: i64,
    pub event_type: String,
    pub subject: String,
    pub details: Value,
}

pub fn log_audit_internal(event_type: &str, subject: &str, details: Value) {
    let event = AuditEvent {
        timestamp: now_ms_epoch(),
        event_type: event_type.to_string(),
        subject: subject.to_string(),
        details,
    };

    // Serialize up front so the audit file receives one clean JSON object per line.
    if let Ok(json_str) = serde_json::to_string(&event) {
        info!(target: AUDIT_TARGET, "{}", json_str);
    }
}
