use castline_core::audit::log_audit_internal;
use castline_persistence::SqliteCastStore;
use castline_ratelimit::{normalize_phone, RateLimiter};
use castline_sms::{mask_phone, SmsSender};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::error::GatewayError;

const CODE_TTL_MINUTES: i64 = 10;
const MAX_VERIFY_ATTEMPTS: i64 = 5;

pub const MSG_INVALID_PHONE: &str = "電話番号の形式が正しくありません。";
pub const MSG_INVALID_CODE: &str = "認証コードが正しくないか、有効期限が切れています。";

/// Sends and checks SMS verification codes for cast phone numbers.
#[derive(Clone)]
pub struct PhoneVerificationService {
    store: SqliteCastStore,
    limiter: Arc<RateLimiter>,
    sms: Arc<dyn SmsSender>,
    code_ttl: Duration,
}

impl PhoneVerificationService {
    pub fn new(store: SqliteCastStore, limiter: Arc<RateLimiter>, sms: Arc<dyn SmsSender>) -> Self {
        Self {
            store,
            limiter,
            sms,
            code_ttl: Duration::minutes(CODE_TTL_MINUTES),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Issue a new code for `raw_phone`. Returns when the code expires.
    ///
    /// The attempt is counted as soon as the limiter admits it, so a send that
    /// later fails downstream still uses up one of the window's attempts.
    pub async fn send_code(&self, raw_phone: &str) -> Result<DateTime<Utc>, GatewayError> {
        let phone = normalize_phone(raw_phone)
            .map_err(|_| GatewayError::Validation(MSG_INVALID_PHONE.to_string()))?;

        let decision = self.limiter.check_and_record(&phone).await;
        if !decision.allowed {
            let retry_after_secs = decision.retry_after_secs.unwrap_or(1);
            warn!(phone = %mask_phone(&phone), retry_after_secs, "Verification send rate limited");
            log_audit_internal(
                "phone_code_rate_limited",
                &mask_phone(&phone),
                json!({ "retry_after_secs": retry_after_secs }),
            );
            return Err(GatewayError::RateLimited { retry_after_secs });
        }

        let code = generate_verification_code();
        let expires_at = Utc::now() + self.code_ttl;
        self.store
            .upsert_verification(&phone, &code, expires_at)
            .await?;

        let body = format!(
            "認証コード: {} ({}分間有効です)",
            code,
            self.code_ttl.num_minutes()
        );
        if let Err(e) = self.sms.send(&phone, &body).await {
            // A code nobody received must not stay valid.
            self.store.delete_verification(&phone).await?;
            return Err(GatewayError::Downstream(anyhow::Error::new(e).context("SMS send failed")));
        }

        info!(phone = %mask_phone(&phone), "Verification code sent");
        Ok(expires_at)
    }

    /// Check `code` for `raw_phone` and, on success, mark the cast's phone verified.
    ///
    /// Every call spends one of the code's `MAX_VERIFY_ATTEMPTS` before the
    /// comparison happens; once they are gone the code is dropped.
    pub async fn verify_code(
        &self,
        cast_id: i64,
        raw_phone: &str,
        code: &str,
    ) -> Result<(), GatewayError> {
        let phone = normalize_phone(raw_phone)
            .map_err(|_| GatewayError::Validation(MSG_INVALID_PHONE.to_string()))?;
        let invalid = || GatewayError::Validation(MSG_INVALID_CODE.to_string());

        let now = Utc::now();
        let Some(expected) = self
            .store
            .reserve_verification_attempt(&phone, MAX_VERIFY_ATTEMPTS, now)
            .await?
        else {
            // Missing, expired or out of attempts.
            self.store
                .delete_dead_verification(&phone, MAX_VERIFY_ATTEMPTS, now)
                .await?;
            return Err(invalid());
        };

        if !bool::from(expected.as_bytes().ct_eq(code.trim().as_bytes())) {
            warn!(phone = %mask_phone(&phone), "Verification code mismatch");
            return Err(invalid());
        }

        if !self.store.mark_phone_verified(cast_id, &phone, now).await? {
            return Err(GatewayError::Validation("キャストが見つかりません。".to_string()));
        }
        self.store.delete_verification(&phone).await?;

        log_audit_internal(
            "phone_verified",
            &format!("cast:{}", cast_id),
            json!({ "phone": mask_phone(&phone) }),
        );
        Ok(())
    }

    pub async fn purge_expired(&self) -> anyhow::Result<u64> {
        self.store.purge_expired_verifications(Utc::now()).await
    }
}

/// Six-digit numeric code, zero padded.
pub fn generate_verification_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{:06}", n)
}
