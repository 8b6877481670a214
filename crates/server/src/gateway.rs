use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use castline_core::audit::log_audit_internal;
use castline_core::metrics::MetricsStore;
use castline_line::{parse_webhook_body, verify, DispatchResult, Dispatcher, SIGNATURE_HEADER};
use castline_persistence::SqliteCastStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::verification::PhoneVerificationService;

pub const CAST_ID_HEADER: &str = "x-cast-id";

#[derive(Clone)]
pub struct AppState {
    /// If set, cast endpoints require `Authorization: Bearer <token>`
    pub auth_token: Option<String>,
    /// LINE channel secret; the webhook answers 503 while unset
    pub line_channel_secret: Option<String>,
    pub dispatcher: Arc<Dispatcher>,
    pub verification: PhoneVerificationService,
    pub store: SqliteCastStore,
    pub metrics: Arc<MetricsStore>,
}

pub struct Gateway {
    state: AppState,
    port: u16,
    max_body_bytes: usize,
    sweep_interval: Duration,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub ok: bool,
    pub results: Vec<DispatchResult>,
}

#[derive(Deserialize, Default)]
struct SendCodeRequest {
    #[serde(default)]
    phone: Option<String>,
}

#[derive(Deserialize)]
struct VerifyCodeRequest {
    phone: String,
    code: String,
}

impl Gateway {
    pub fn new(state: AppState, port: u16) -> Self {
        Self {
            state,
            port,
            max_body_bytes: 1024 * 1024,
            sweep_interval: Duration::from_secs(60),
        }
    }

    pub fn with_body_limit(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn with_sweep_interval(mut self, every: Duration) -> Self {
        self.sweep_interval = every;
        self
    }

    /// Serve until `shutdown` resolves. Background sweeps live exactly as long as the server.
    pub async fn start(
        &self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let sweeper = self
            .state
            .verification
            .limiter()
            .spawn_sweeper(self.sweep_interval);

        let purge_task = {
            let verification = self.state.verification.clone();
            let every = self.sweep_interval;
            tokio::spawn(async move {
                let mut ticker = interval(every);
                loop {
                    ticker.tick().await;
                    match verification.purge_expired().await {
                        Ok(0) => {}
                        Ok(n) => debug!(purged = n, "Purged expired verification codes"),
                        Err(e) => warn!(error = %e, "Failed to purge verification codes"),
                    }
                }
            })
        };

        let app = router(self.state.clone()).layer(DefaultBodyLimit::max(self.max_body_bytes));

        // Security: bind to localhost-only if no auth token configured
        let addr = if self.state.auth_token.is_some() {
            SocketAddr::from(([0, 0, 0, 0], self.port))
        } else {
            warn!("No gateway auth token configured, binding to 127.0.0.1 only");
            SocketAddr::from(([127, 0, 0, 1], self.port))
        };
        if self.state.line_channel_secret.is_none() {
            warn!("LINE channel secret not configured; webhook will answer 503");
        }

        info!("Gateway listening on {}", addr);

        let listener = TcpListener::bind(addr).await?;
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        sweeper.shutdown();
        purge_task.abort();
        info!("Gateway stopped");

        served?;
        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/monitor/metrics", get(get_metrics))
        .route("/api/line/webhook", post(line_webhook))
        .route("/api/cast/phone/send", post(send_phone_code))
        .route("/api/cast/phone/verify", post(verify_phone_code))
        .with_state(state)
}

/// Verify the Authorization header against the configured token.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), GatewayError> {
    let Some(expected_token) = &state.auth_token else {
        // No auth configured = local-only, all requests allowed
        return Ok(());
    };

    let provided_token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if bool::from(provided_token.as_bytes().ct_eq(expected_token.as_bytes())) {
        Ok(())
    } else {
        warn!("Unauthorized gateway access attempt");
        Err(GatewayError::Unauthorized)
    }
}

fn cast_id_from(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(CAST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "metrics": state.metrics.snapshot(),
        "rate_limit_tracked_keys": state.verification.limiter().tracked_keys().await,
    }))
}

/// POST /api/line/webhook
///
/// 503 without a channel secret, 403 on a bad signature, 400 on a body that
/// does not decode. Otherwise 200 with one result per event, including when
/// some of those events failed, so LINE does not redeliver the whole batch.
async fn line_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, GatewayError> {
    state.metrics.inc_webhooks_received();

    let Some(secret) = state.line_channel_secret.as_deref() else {
        error!("LINE webhook received but no channel secret is configured");
        return Err(GatewayError::Configuration("LINE channel is not configured"));
    };

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if !verify(secret, &body, signature) {
        state.metrics.inc_webhooks_rejected();
        warn!(has_signature = signature.is_some(), "LINE webhook signature rejected");
        log_audit_internal(
            "line_signature_rejected",
            "line",
            json!({ "has_signature": signature.is_some(), "body_len": body.len() }),
        );
        return Err(GatewayError::Authentication("Invalid signature"));
    }

    let payload = parse_webhook_body(&body).map_err(|e| {
        state.metrics.inc_webhooks_rejected();
        warn!(error = %e, "LINE webhook payload rejected");
        match e {
            castline_line::LineError::InvalidPayload(ref inner) if inner.is_data() => {
                GatewayError::Validation("Invalid payload".to_string())
            }
            _ => GatewayError::Validation("Invalid JSON".to_string()),
        }
    })?;

    let results = state.dispatcher.dispatch(&payload.events).await;
    let failed = results.iter().filter(|r| r.is_failed()).count();
    state
        .metrics
        .add_events(results.len() as u64, failed as u64);
    info!(
        events = results.len(),
        failed,
        destination = payload.destination.as_deref().unwrap_or_default(),
        "LINE webhook dispatched"
    );

    Ok(Json(WebhookResponse { ok: true, results }))
}

/// POST /api/cast/phone/send
async fn send_phone_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, GatewayError> {
    check_auth(&state, &headers)?;

    let req: SendCodeRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SendCodeRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|_| GatewayError::Validation("リクエストの形式が正しくありません。".to_string()))?
    };

    let phone = match req.phone.filter(|p| !p.trim().is_empty()) {
        Some(phone) => phone,
        None => phone_of_cast(&state, &headers).await?,
    };

    let result = state.verification.send_code(&phone).await;
    match &result {
        Ok(_) => state.metrics.inc_codes_sent(),
        Err(GatewayError::RateLimited { .. }) => state.metrics.inc_rate_limited(),
        Err(_) => {}
    }
    let expires_at = result?;

    Ok(Json(json!({
        "success": true,
        "expiresAt": expires_at.to_rfc3339(),
    })))
}

/// Phone on record for the cast named by `x-cast-id`.
async fn phone_of_cast(state: &AppState, headers: &HeaderMap) -> Result<String, GatewayError> {
    let missing = || GatewayError::Validation("電話番号が登録されていません。".to_string());
    let Some(cast_id) = cast_id_from(headers) else {
        return Err(missing());
    };
    let cast = state.store.get_cast(cast_id).await?;
    cast.and_then(|c| c.phone).ok_or_else(missing)
}

/// POST /api/cast/phone/verify
async fn verify_phone_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, GatewayError> {
    check_auth(&state, &headers)?;

    let Some(cast_id) = cast_id_from(&headers) else {
        return Err(GatewayError::Validation("キャストが指定されていません。".to_string()));
    };
    let req: VerifyCodeRequest = serde_json::from_slice(&body)
        .map_err(|_| GatewayError::Validation("リクエストの形式が正しくありません。".to_string()))?;

    state
        .verification
        .verify_code(cast_id, &req.phone, &req.code)
        .await?;

    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::RegistrationService;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use castline_line::dispatch::{EventHandler, HandlerError, HandlerOutcome};
    use castline_line::event::WebhookEvent;
    use castline_line::{sign, EventKind};
    use castline_ratelimit::{InMemoryAttemptStore, ManualClock, RateLimitPolicy, RateLimiter};
    use castline_sms::{SmsError, SmsSender};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const SECRET: &str = "test-channel-secret";

    struct NullSms;

    #[async_trait]
    impl SmsSender for NullSms {
        async fn send(&self, _to: &str, _body: &str) -> Result<(), SmsError> {
            Ok(())
        }
    }

    /// Fails follow events from the user id "UFAIL".
    struct FlakyHandler;

    #[async_trait]
    impl EventHandler for FlakyHandler {
        async fn handle_event(&self, event: &WebhookEvent) -> Result<HandlerOutcome, HandlerError> {
            if event.user_id() == Some("UFAIL") {
                return Err(HandlerError::Downstream(anyhow::anyhow!("db timeout")));
            }
            Ok(HandlerOutcome::Handled(None))
        }
    }

    async fn state_with(secret: Option<&str>, dispatcher: Option<Dispatcher>) -> AppState {
        let store = SqliteCastStore::in_memory().await.expect("store");
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(InMemoryAttemptStore::new()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            RateLimitPolicy::default(),
        ));
        let verification = PhoneVerificationService::new(store.clone(), limiter, Arc::new(NullSms));
        let dispatcher =
            dispatcher.unwrap_or_else(|| RegistrationService::new(store.clone(), None).into_dispatcher());

        AppState {
            auth_token: None,
            line_channel_secret: secret.map(str::to_string),
            dispatcher: Arc::new(dispatcher),
            verification,
            store,
            metrics: MetricsStore::new(),
        }
    }

    async fn post(state: AppState, uri: &str, headers: &[(&str, &str)], body: &str) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(Method::POST).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::from(body.to_string())).expect("request");

        let response = router(state).oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn post_webhook(state: AppState, signature: Option<&str>, body: &str) -> (StatusCode, Value) {
        match signature {
            Some(sig) => post(state, "/api/line/webhook", &[(SIGNATURE_HEADER, sig)], body).await,
            None => post(state, "/api/line/webhook", &[], body).await,
        }
    }

    #[tokio::test]
    async fn invalid_signature_is_forbidden() {
        let state = state_with(Some(SECRET), None).await;
        let body = r#"{"events":[]}"#;

        let (status, json) = post_webhook(state, Some("aW52YWxpZA=="), body).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json, json!({ "error": "Invalid signature" }));
    }

    #[tokio::test]
    async fn missing_signature_is_forbidden() {
        let state = state_with(Some(SECRET), None).await;
        let (status, _) = post_webhook(state, None, r#"{"events":[]}"#).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unconfigured_secret_is_unavailable() {
        let state = state_with(None, None).await;
        let body = r#"{"events":[]}"#;
        let (status, json) = post_webhook(state, Some(&sign(SECRET, body.as_bytes())), body).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(json.get("error").is_some());
    }

    #[tokio::test]
    async fn malformed_bodies_are_bad_requests() {
        for body in ["{not json", r#"{"events":"nope"}"#, r#"{"events":[{"type":"message"}]}"#] {
            let state = state_with(Some(SECRET), None).await;
            let (status, _) = post_webhook(state, Some(&sign(SECRET, body.as_bytes())), body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
        }
    }

    #[tokio::test]
    async fn empty_event_list_is_ok() {
        let state = state_with(Some(SECRET), None).await;
        let body = r#"{"destination":"Ubot","events":[]}"#;
        let (status, json) = post_webhook(state, Some(&sign(SECRET, body.as_bytes())), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!({ "ok": true, "results": [] }));
    }

    #[tokio::test]
    async fn partial_failure_still_answers_ok() {
        let dispatcher = Dispatcher::new().register(EventKind::Follow, Arc::new(FlakyHandler));
        let state = state_with(Some(SECRET), Some(dispatcher)).await;
        let metrics = state.metrics.clone();
        let body = r#"{"events":[
            {"type":"follow","source":{"type":"user","userId":"U0"}},
            {"type":"follow","source":{"type":"user","userId":"UFAIL"}},
            {"type":"videoPlayComplete","source":{"type":"user","userId":"U2"}},
            {"type":"follow","source":{"type":"user","userId":"U3"}}
        ]}"#;

        let (status, json) = post_webhook(state, Some(&sign(SECRET, body.as_bytes())), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], json!(true));

        let results = json["results"].as_array().expect("results");
        assert_eq!(results.len(), 4);
        assert_eq!(results[0]["status"], "success");
        assert_eq!(results[1]["status"], "failed");
        assert_eq!(results[1]["message"], "internal error");
        assert_eq!(results[2]["status"], "ignored");
        assert_eq!(results[3]["status"], "success");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_dispatched, 4);
        assert_eq!(snapshot.events_failed, 1);
    }

    #[tokio::test]
    async fn signature_covers_exact_bytes() {
        let state = state_with(Some(SECRET), None).await;
        let signed = r#"{"events":[]}"#;
        let sent = r#"{"events": []}"#;
        let (status, _) = post_webhook(state, Some(&sign(SECRET, signed.as_bytes())), sent).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn send_code_is_throttled_after_three_attempts() {
        let state = state_with(Some(SECRET), None).await;
        let body = r#"{"phone":"09000000000"}"#;

        for _ in 0..3 {
            let (status, json) = post(state.clone(), "/api/cast/phone/send", &[], body).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["success"], json!(true));
            assert!(json["expiresAt"].is_string());
        }

        let (status, json) = post(state.clone(), "/api/cast/phone/send", &[], body).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json["retryAfter"], json!(900));
        assert!(json["error"].as_str().expect("error").contains("900"));
        assert_eq!(state.metrics.snapshot().rate_limited, 1);
    }

    #[tokio::test]
    async fn send_code_derives_phone_from_cast() {
        let state = state_with(Some(SECRET), None).await;
        let cast = state
            .store
            .create_cast(1, "Aoi", Some("09011112222"), None)
            .await
            .expect("cast");
        let cast_id = cast.id.to_string();

        let (status, _) = post(state.clone(), "/api/cast/phone/send", &[(CAST_ID_HEADER, cast_id.as_str())], "").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = post(state, "/api/cast/phone/send", &[], "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bearer_token_guards_cast_endpoints() {
        let mut state = state_with(Some(SECRET), None).await;
        state.auth_token = Some("s3cret".to_string());
        let body = r#"{"phone":"09000000000"}"#;

        let (status, _) = post(state.clone(), "/api/cast/phone/send", &[], body).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = post(
            state,
            "/api/cast/phone/send",
            &[("authorization", "Bearer s3cret")],
            body,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn verify_requires_cast_header() {
        let state = state_with(Some(SECRET), None).await;
        let (status, _) = post(
            state,
            "/api/cast/phone/verify",
            &[],
            r#"{"phone":"09000000000","code":"123456"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
