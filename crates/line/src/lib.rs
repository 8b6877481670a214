//! LINE Messaging API webhook plumbing: signature checks, typed events,
//! per-event dispatch and the reply client.

pub mod client;
pub mod dispatch;
pub mod event;
pub mod signature;

use thiserror::Error;

pub use client::{LineClient, ReplySender};
pub use dispatch::{DispatchOutcome, DispatchResult, Dispatcher, EventHandler, HandlerError, HandlerOutcome};
pub use event::{parse_webhook_body, EventKind, WebhookBody, WebhookEvent};
pub use signature::{sign, verify, SIGNATURE_HEADER};

#[derive(Debug, Error)]
pub enum LineError {
    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("LINE API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("LINE API returned {status}: {body}")]
    Api { status: u16, body: String },
}
