use async_trait::async_trait;
use castline_core::audit::log_audit_internal;
use castline_line::dispatch::{EventHandler, HandlerError, HandlerOutcome};
use castline_line::event::{MessageContent, WebhookEvent};
use castline_line::{Dispatcher, EventKind, ReplySender};
use castline_persistence::{LinkOutcome, SqliteCastStore};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Unambiguous characters only (no 0/O, 1/I/L).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 8;

const REPLY_WELCOME: &str =
    "友だち追加ありがとうございます。店舗から受け取った登録コードを送信してください。";
const REPLY_ALREADY_LINKED: &str = "このLINEアカウントは既に登録済みです。";
const REPLY_CODE_NOT_FOUND: &str = "登録コードが見つかりません。もう一度ご確認ください。";
const REPLY_UNLINKED: &str = "LINE連携を解除しました。";

/// Links LINE accounts to cast records from webhook events.
///
/// A cast receives a one-time registration code from their store, adds the
/// official account as a friend and sends the code as a text message.
#[derive(Clone)]
pub struct RegistrationService {
    store: SqliteCastStore,
    replier: Option<Arc<dyn ReplySender>>,
}

impl RegistrationService {
    pub fn new(store: SqliteCastStore, replier: Option<Arc<dyn ReplySender>>) -> Self {
        Self { store, replier }
    }

    /// Dispatcher with this service registered for every event type it understands.
    pub fn into_dispatcher(self) -> Dispatcher {
        let handler: Arc<dyn EventHandler> = Arc::new(self);
        Dispatcher::new()
            .register(EventKind::Follow, handler.clone())
            .register(EventKind::Unfollow, handler.clone())
            .register(EventKind::Message, handler.clone())
            .register(EventKind::Postback, handler)
    }

    async fn reply(&self, reply_token: Option<&str>, text: &str) {
        let (Some(replier), Some(token)) = (&self.replier, reply_token) else {
            return;
        };
        if let Err(e) = replier.reply_text(token, text).await {
            warn!(error = %e, "LINE reply failed; event result unaffected");
        }
    }

    async fn on_follow(
        &self,
        user_id: &str,
        reply_token: Option<&str>,
    ) -> Result<HandlerOutcome, HandlerError> {
        if self.store.find_by_line_user(user_id).await?.is_some() {
            self.reply(reply_token, REPLY_ALREADY_LINKED).await;
            return Ok(HandlerOutcome::Handled(Some("already_registered".to_string())));
        }
        self.reply(reply_token, REPLY_WELCOME).await;
        Ok(HandlerOutcome::Handled(Some("awaiting_code".to_string())))
    }

    async fn on_unlink(
        &self,
        user_id: &str,
        reply_token: Option<&str>,
    ) -> Result<HandlerOutcome, HandlerError> {
        match self.store.unlink_line_user(user_id).await? {
            Some(cast_id) => {
                info!(cast_id, "LINE account unlinked");
                log_audit_internal("line_unlinked", &format!("cast:{}", cast_id), json!({}));
                self.reply(reply_token, REPLY_UNLINKED).await;
                Ok(HandlerOutcome::Handled(Some("unlinked".to_string())))
            }
            None => Ok(HandlerOutcome::Ignored(Some("not_linked".to_string()))),
        }
    }

    async fn on_text(
        &self,
        user_id: &str,
        text: &str,
        reply_token: Option<&str>,
    ) -> Result<HandlerOutcome, HandlerError> {
        let Some(code) = normalize_registration_code(text) else {
            return Ok(HandlerOutcome::Ignored(Some("not_a_registration_code".to_string())));
        };

        if self.store.find_by_line_user(user_id).await?.is_some() {
            self.reply(reply_token, REPLY_ALREADY_LINKED).await;
            return Ok(HandlerOutcome::Ignored(Some("already_registered".to_string())));
        }

        let Some(cast) = self.store.find_by_registration_code(&code).await? else {
            self.reply(reply_token, REPLY_CODE_NOT_FOUND).await;
            return Err(HandlerError::Rejected("registration code not found".to_string()));
        };

        match self.store.link_line_user(cast.id, user_id).await? {
            LinkOutcome::Linked => {
                info!(cast_id = cast.id, store_id = cast.store_id, "LINE account linked");
                log_audit_internal(
                    "line_linked",
                    &format!("cast:{}", cast.id),
                    json!({ "store_id": cast.store_id }),
                );
                self.reply(
                    reply_token,
                    &format!("登録が完了しました。{}さん、よろしくお願いします。", cast.name),
                )
                .await;
                Ok(HandlerOutcome::Handled(Some("linked".to_string())))
            }
            LinkOutcome::AlreadyLinkedElsewhere => Err(HandlerError::Rejected(
                "LINE account already linked".to_string(),
            )),
            LinkOutcome::CastNotFound => Err(HandlerError::Rejected(
                "registration code not found".to_string(),
            )),
        }
    }
}

#[async_trait]
impl EventHandler for RegistrationService {
    async fn handle_event(&self, event: &WebhookEvent) -> Result<HandlerOutcome, HandlerError> {
        let Some(user_id) = event.user_id() else {
            return Ok(HandlerOutcome::Ignored(Some("no_user_source".to_string())));
        };
        let reply_token = event.reply_token();

        match event {
            WebhookEvent::Follow(_) => self.on_follow(user_id, reply_token).await,
            WebhookEvent::Unfollow(_) => self.on_unlink(user_id, None).await,
            WebhookEvent::Message(m) => match &m.message {
                MessageContent::Text { text, .. } => self.on_text(user_id, text, reply_token).await,
                MessageContent::Other => {
                    Ok(HandlerOutcome::Ignored(Some("non_text_message".to_string())))
                }
            },
            WebhookEvent::Postback(p) => match p.postback.param("action") {
                Some("unlink") => self.on_unlink(user_id, reply_token).await,
                _ => Ok(HandlerOutcome::Ignored(Some("unsupported_postback".to_string()))),
            },
            WebhookEvent::Unknown => Ok(HandlerOutcome::Ignored(None)),
        }
    }
}

/// Uppercase, strip whitespace and hyphens; `None` if the text cannot be a code.
pub fn normalize_registration_code(text: &str) -> Option<String> {
    let code: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let plausible = (4..=16).contains(&code.len()) && code.chars().all(|c| c.is_ascii_alphanumeric());
    plausible.then_some(code)
}

pub fn generate_registration_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}
