use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SmsError {
    #[error("SMS gateway rejected the message with {status}")]
    Rejected { status: u16 },
    #[error("failed to deliver SMS after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// Outbound text message delivery.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<(), SmsError>;
}

/// Generic HTTP SMS gateway: `POST {endpoint}` with a bearer key and a
/// `{to, from, body}` JSON payload.
#[derive(Clone)]
pub struct HttpSmsGateway {
    endpoint: String,
    api_key: String,
    sender: Option<String>,
    max_attempts: u32,
    retry_jitter_ms: u64,
    client: Client,
}

impl HttpSmsGateway {
    pub fn new(endpoint: String, api_key: String, sender: Option<String>) -> Self {
        Self {
            endpoint,
            api_key,
            sender,
            max_attempts: 3,
            retry_jitter_ms: 250,
            client: Client::builder()
                .timeout(StdDuration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn jitter_delay(&self, attempt: u32) -> StdDuration {
        if self.retry_jitter_ms == 0 {
            return StdDuration::from_millis(0);
        }
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let jitter = (seed ^ ((attempt as u64) << 7)) % (self.retry_jitter_ms + 1);
        StdDuration::from_millis(jitter)
    }
}

#[async_trait]
impl SmsSender for HttpSmsGateway {
    async fn send(&self, to: &str, body: &str) -> Result<(), SmsError> {
        let payload = json!({
            "to": to,
            "from": self.sender,
            "body": body,
        });

        let mut delay = Duration::from_secs(1);
        for attempt in 1..=self.max_attempts {
            let resp = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()
                .await;

            match resp {
                Ok(r) if r.status().is_success() => {
                    info!(attempt, "SMS sent");
                    return Ok(());
                }
                Ok(r) if r.status().is_client_error() => {
                    let status = r.status();
                    let body = r.text().await.unwrap_or_default();
                    warn!(attempt, %status, body = %body, "SMS gateway rejected message");
                    return Err(SmsError::Rejected {
                        status: status.as_u16(),
                    });
                }
                Ok(r) => {
                    let status = r.status();
                    warn!(attempt, %status, "SMS gateway error");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "SMS gateway network error");
                }
            }

            if attempt < self.max_attempts {
                sleep(delay + self.jitter_delay(attempt)).await;
                delay *= 2;
            }
        }

        Err(SmsError::Exhausted {
            attempts: self.max_attempts,
        })
    }
}

/// Writes messages to the log instead of sending them. Used when no SMS
/// gateway is configured; the message body is only emitted at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlySms;

#[async_trait]
impl SmsSender for LogOnlySms {
    async fn send(&self, to: &str, body: &str) -> Result<(), SmsError> {
        warn!(to = %mask_phone(to), "No SMS gateway configured, message not delivered");
        debug!(to = %to, body = %body, "Undelivered SMS");
        Ok(())
    }
}

/// Keep the last four digits of a phone number for logs.
pub fn mask_phone(phone: &str) -> String {
    let digits = phone.chars().count();
    if digits <= 4 {
        return "****".to_string();
    }
    let tail: String = phone.chars().skip(digits - 4).collect();
    format!("{}{}", "*".repeat(digits - 4), tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[test]
    fn mask_phone_keeps_tail() {
        assert_eq!(mask_phone("09012345678"), "*******5678");
        assert_eq!(mask_phone("123"), "****");
    }

    #[tokio::test]
    async fn unreachable_gateway_exhausts_attempts() {
        // Port 9 (discard) on localhost is not an HTTP server.
        let gateway = HttpSmsGateway::new(
            "http://127.0.0.1:9/sms".to_string(),
            "key".to_string(),
            None,
        )
        .with_max_attempts(1);

        let err = gateway
            .send("09012345678", "code")
            .await
            .expect_err("send should fail");
        assert!(matches!(err, SmsError::Exhausted { attempts: 1 }));
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Ok(mut out) = self.0.lock() {
                out.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn log_only_sender_writes_body_at_debug() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        assert!(LogOnlySms
            .send("09012345678", "認証コード: 482913")
            .await
            .is_ok());

        let output = String::from_utf8(log.0.lock().expect("log").clone()).expect("utf8");
        assert!(output.contains("482913"), "log was: {output}");
        assert!(output.contains("DEBUG"));
    }

    #[tokio::test]
    async fn log_only_sender_hides_body_at_info() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        LogOnlySms
            .send("09012345678", "認証コード: 482913")
            .await
            .expect("send");

        let output = String::from_utf8(log.0.lock().expect("log").clone()).expect("utf8");
        assert!(output.contains("*******5678"));
        assert!(!output.contains("482913"));
    }
}
