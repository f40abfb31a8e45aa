//! Wire shapes for the EventSub WebSocket transport (spec.md §6). Every
//! inbound frame is `{metadata, payload}`; `metadata.message_type`
//! discriminates the payload shape, modeled here as a sum type rather than
//! one wide struct with nullable siblings.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub metadata: Metadata,
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub message_id: String,
    pub message_type: String,
    #[serde(default)]
    pub subscription_type: Option<String>,
    #[serde(default)]
    pub subscription_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionPayload {
    pub session: SessionInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub status: String,
    pub keepalive_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub reconnect_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationPayload {
    pub subscription: SubscriptionRef,
    pub event: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionRef {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevocationPayload {
    pub subscription: SubscriptionRef,
}

/// The parsed, dispatch-ready form of an inbound frame.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Welcome(SessionInfo),
    Keepalive,
    Reconnect(SessionInfo),
    Notification(NotificationPayload),
    Revocation(RevocationPayload),
    Unknown(String),
}

pub fn parse(text: &str) -> crate::error::Result<(String, ServerMessage)> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let message_id = envelope.metadata.message_id.clone();
    let msg = match envelope.metadata.message_type.as_str() {
        "session_welcome" => {
            let p: SessionPayload = serde_json::from_value(envelope.payload)?;
            ServerMessage::Welcome(p.session)
        }
        "session_keepalive" => ServerMessage::Keepalive,
        "session_reconnect" => {
            let p: SessionPayload = serde_json::from_value(envelope.payload)?;
            ServerMessage::Reconnect(p.session)
        }
        "notification" => {
            let p: NotificationPayload = serde_json::from_value(envelope.payload)?;
            ServerMessage::Notification(p)
        }
        "revocation" => {
            let p: RevocationPayload = serde_json::from_value(envelope.payload)?;
            ServerMessage::Revocation(p)
        }
        other => ServerMessage::Unknown(other.to_string()),
    };
    Ok((message_id, msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_welcome() {
        let text = r#"{"metadata":{"message_id":"1","message_type":"session_welcome"},"payload":{"session":{"id":"S1","status":"connected","keepalive_timeout_seconds":10,"reconnect_url":null}}}"#;
        let (id, msg) = parse(text).unwrap();
        assert_eq!(id, "1");
        assert!(matches!(msg, ServerMessage::Welcome(s) if s.id == "S1"));
    }

    #[test]
    fn parses_notification() {
        let text = r#"{"metadata":{"message_id":"2","message_type":"notification","subscription_type":"channel.follow"},"payload":{"subscription":{"id":"sub1","type":"channel.follow","version":"2","status":"enabled"},"event":{"user_id":"1"}}}"#;
        let (_, msg) = parse(text).unwrap();
        match msg {
            ServerMessage::Notification(n) => assert_eq!(n.subscription.id, "sub1"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_message_type_is_preserved_not_rejected() {
        let text = r#"{"metadata":{"message_id":"3","message_type":"something_new"},"payload":{}}"#;
        let (_, msg) = parse(text).unwrap();
        assert!(matches!(msg, ServerMessage::Unknown(t) if t == "something_new"));
    }
}
