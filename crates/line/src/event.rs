use serde::{Deserialize, Serialize};

use crate::LineError;

/// Top-level webhook body: `{ "destination": "...", "events": [...] }`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookBody {
    #[serde(default)]
    pub destination: Option<String>,
    pub events: Vec<WebhookEvent>,
}

/// Decode the raw body. Known event types must match their shape exactly;
/// any other `type` decodes to [`WebhookEvent::Unknown`].
pub fn parse_webhook_body(raw_body: &[u8]) -> Result<WebhookBody, LineError> {
    Ok(serde_json::from_slice(raw_body)?)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WebhookEvent {
    Follow(FollowEvent),
    Unfollow(UnfollowEvent),
    Message(MessageEvent),
    Postback(PostbackEvent),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Follow,
    Unfollow,
    Message,
    Postback,
    Unknown,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::Unfollow => "unfollow",
            Self::Message => "message",
            Self::Postback => "postback",
            Self::Unknown => "unknown",
        }
    }
}

impl WebhookEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Follow(_) => EventKind::Follow,
            Self::Unfollow(_) => EventKind::Unfollow,
            Self::Message(_) => EventKind::Message,
            Self::Postback(_) => EventKind::Postback,
            Self::Unknown => EventKind::Unknown,
        }
    }

    pub fn context(&self) -> Option<&EventContext> {
        match self {
            Self::Follow(e) => Some(&e.context),
            Self::Unfollow(e) => Some(&e.context),
            Self::Message(e) => Some(&e.context),
            Self::Postback(e) => Some(&e.context),
            Self::Unknown => None,
        }
    }

    /// LINE user id of whoever triggered the event, if the source carries one.
    pub fn user_id(&self) -> Option<&str> {
        self.context()
            .and_then(|c| c.source.as_ref())
            .and_then(Source::user_id)
    }

    pub fn reply_token(&self) -> Option<&str> {
        self.context()
            .and_then(|c| c.reply_token.as_deref())
            .filter(|t| !t.is_empty())
    }

    pub fn webhook_event_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.webhook_event_id.as_deref())
    }
}

/// Fields shared by every event type.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub source: Option<Source>,
    #[serde(default)]
    pub reply_token: Option<String>,
    #[serde(default)]
    pub webhook_event_id: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Source {
    User {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Group {
        #[serde(rename = "groupId")]
        group_id: String,
        #[serde(rename = "userId", default)]
        user_id: Option<String>,
    },
    Room {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userId", default)]
        user_id: Option<String>,
    },
}

impl Source {
    pub fn user_id(&self) -> Option<&str> {
        let user_id = match self {
            Self::User { user_id } => Some(user_id.as_str()),
            Self::Group { user_id, .. } | Self::Room { user_id, .. } => user_id.as_deref(),
        };
        user_id.filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FollowEvent {
    #[serde(flatten)]
    pub context: EventContext,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnfollowEvent {
    #[serde(flatten)]
    pub context: EventContext,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEvent {
    #[serde(flatten)]
    pub context: EventContext,
    pub message: MessageContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text { id: String, text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostbackEvent {
    #[serde(flatten)]
    pub context: EventContext,
    pub postback: PostbackContent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostbackContent {
    pub data: String,
}

impl PostbackContent {
    /// Look up `key` in `a=1&b=2` style postback data.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.data
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_and_unknown_events_in_order() {
        let body = br#"{
            "destination": "Ubot",
            "events": [
                {"type": "follow", "timestamp": 1, "replyToken": "r1",
                 "source": {"type": "user", "userId": "U1"}, "webhookEventId": "e1", "mode": "active"},
                {"type": "message", "timestamp": 2, "replyToken": "r2",
                 "source": {"type": "user", "userId": "U2"},
                 "message": {"type": "text", "id": "m1", "text": "ABC123"}},
                {"type": "beacon", "timestamp": 3, "beacon": {"hwid": "x"}},
                {"type": "postback", "timestamp": 4,
                 "source": {"type": "group", "groupId": "G1", "userId": "U3"},
                 "postback": {"data": "action=unlink&id=7"}},
                {"type": "unfollow", "timestamp": 5, "source": {"type": "user", "userId": "U4"}}
            ]
        }"#;

        let parsed = parse_webhook_body(body).expect("body");
        assert_eq!(parsed.destination.as_deref(), Some("Ubot"));
        let kinds: Vec<_> = parsed.events.iter().map(WebhookEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Follow,
                EventKind::Message,
                EventKind::Unknown,
                EventKind::Postback,
                EventKind::Unfollow
            ]
        );

        assert_eq!(parsed.events[0].user_id(), Some("U1"));
        assert_eq!(parsed.events[0].reply_token(), Some("r1"));
        assert_eq!(parsed.events[0].webhook_event_id(), Some("e1"));
        assert_eq!(parsed.events[3].user_id(), Some("U3"));

        let WebhookEvent::Message(msg) = &parsed.events[1] else {
            panic!("expected message event");
        };
        assert!(matches!(&msg.message, MessageContent::Text { text, .. } if text == "ABC123"));

        let WebhookEvent::Postback(pb) = &parsed.events[3] else {
            panic!("expected postback event");
        };
        assert_eq!(pb.postback.param("action"), Some("unlink"));
        assert_eq!(pb.postback.param("missing"), None);
    }

    #[test]
    fn non_text_message_decodes_as_other() {
        let body = br#"{"events":[{"type":"message","source":{"type":"user","userId":"U1"},
            "message":{"type":"sticker","id":"1","packageId":"1","stickerId":"2"}}]}"#;
        let parsed = parse_webhook_body(body).expect("body");
        let WebhookEvent::Message(msg) = &parsed.events[0] else {
            panic!("expected message event");
        };
        assert!(matches!(msg.message, MessageContent::Other));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(parse_webhook_body(b"not json").is_err());
        assert!(parse_webhook_body(br#"{"destination":"U1"}"#).is_err());
        assert!(parse_webhook_body(br#"{"events":{}}"#).is_err());
        // Known type with a missing required field.
        assert!(parse_webhook_body(br#"{"events":[{"type":"postback"}]}"#).is_err());
    }

    #[test]
    fn room_source_without_user_has_no_user_id() {
        let body = br#"{"events":[{"type":"follow","source":{"type":"room","roomId":"R1"}}]}"#;
        let parsed = parse_webhook_body(body).expect("body");
        assert_eq!(parsed.events[0].user_id(), None);
    }
}
