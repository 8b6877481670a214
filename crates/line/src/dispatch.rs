use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::event::{EventKind, WebhookEvent};

/// What a handler made of an event it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Handled(Option<String>),
    Ignored(Option<String>),
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The event was understood but cannot be applied. The message is safe to
    /// return in the per-event result.
    #[error("{0}")]
    Rejected(String),
    /// A collaborator failed. Details are logged, never returned.
    #[error("downstream failure: {0}")]
    Downstream(#[from] anyhow::Error),
}

impl HandlerError {
    fn public_message(&self) -> String {
        match self {
            Self::Rejected(msg) => msg.clone(),
            Self::Downstream(_) => "internal error".to_string(),
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &WebhookEvent) -> Result<HandlerOutcome, HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchOutcome {
    Success,
    Ignored,
    Failed,
}

/// Per-event entry in the webhook response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub status: DispatchOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_event_id: Option<String>,
}

impl DispatchResult {
    fn new(event: &WebhookEvent, status: DispatchOutcome, message: Option<String>) -> Self {
        Self {
            kind: event.kind(),
            status,
            message,
            webhook_event_id: event.webhook_event_id().map(str::to_string),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == DispatchOutcome::Failed
    }
}

/// Routes each event to the handler registered for its type.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Handle one event. Errors and panics inside the handler are turned into
    /// a `failed` result rather than escaping.
    pub async fn handle_event(&self, event: &WebhookEvent) -> DispatchResult {
        let kind = event.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            info!(event_type = kind.as_str(), "No handler for event type, ignoring");
            return DispatchResult::new(event, DispatchOutcome::Ignored, None);
        };

        let outcome = AssertUnwindSafe(handler.handle_event(event))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(HandlerOutcome::Handled(message))) => {
                DispatchResult::new(event, DispatchOutcome::Success, message)
            }
            Ok(Ok(HandlerOutcome::Ignored(message))) => {
                DispatchResult::new(event, DispatchOutcome::Ignored, message)
            }
            Ok(Err(e)) => {
                match &e {
                    HandlerError::Rejected(reason) => {
                        warn!(event_type = kind.as_str(), reason = %reason, "Event rejected by handler")
                    }
                    HandlerError::Downstream(err) => {
                        error!(event_type = kind.as_str(), error = ?err, "Event handler failed")
                    }
                }
                DispatchResult::new(event, DispatchOutcome::Failed, Some(e.public_message()))
            }
            Err(_) => {
                error!(event_type = kind.as_str(), "Event handler panicked");
                DispatchResult::new(
                    event,
                    DispatchOutcome::Failed,
                    Some("internal error".to_string()),
                )
            }
        }
    }

    /// Handle a batch in order, one event at a time. The returned vector has
    /// one entry per input event at the same index.
    pub async fn dispatch(&self, events: &[WebhookEvent]) -> Vec<DispatchResult> {
        let mut results = Vec::with_capacity(events.len());
        for event in events {
            results.push(self.handle_event(event).await);
        }
        results
    }
}
