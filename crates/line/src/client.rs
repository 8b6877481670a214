use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::LineError;

pub const DEFAULT_API_BASE: &str = "https://api.line.me";

#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn reply_text(&self, reply_token: &str, text: &str) -> Result<(), LineError>;
}

/// Minimal LINE Messaging API client used for replying to webhook events.
#[derive(Clone)]
pub struct LineClient {
    access_token: String,
    api_base: String,
    client: Client,
}

impl LineClient {
    pub fn new(access_token: String, api_base: Option<String>) -> Self {
        Self {
            access_token,
            api_base: api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    fn reply_url(&self) -> String {
        format!("{}/v2/bot/message/reply", self.api_base.trim_end_matches('/'))
    }
}

#[async_trait]
impl ReplySender for LineClient {
    /// Reply tokens are single use, so only transport errors and 5xx
    /// responses are retried, and only once.
    async fn reply_text(&self, reply_token: &str, text: &str) -> Result<(), LineError> {
        let payload = json!({
            "replyToken": reply_token,
            "messages": [{ "type": "text", "text": text }]
        });

        let mut last_err = None;
        for attempt in 1..=2 {
            let resp = self
                .client
                .post(self.reply_url())
                .bearer_auth(&self.access_token)
                .json(&payload)
                .send()
                .await;

            match resp {
                Ok(r) if r.status().is_success() => {
                    info!(attempt, "LINE reply sent");
                    return Ok(());
                }
                Ok(r) => {
                    let status = r.status();
                    let body = r.text().await.unwrap_or_default();
                    warn!(attempt, %status, body = %body, "LINE reply failed");
                    let retryable = status.is_server_error();
                    last_err = Some(LineError::Api {
                        status: status.as_u16(),
                        body,
                    });
                    if !retryable {
                        break;
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "LINE reply network error");
                    last_err = Some(LineError::Http(e));
                }
            }

            if attempt < 2 {
                sleep(Duration::from_millis(500)).await;
            }
        }

        Err(last_err.unwrap_or(LineError::Api {
            status: 0,
            body: "no attempt made".to_string(),
        }))
    }
}
