//! Event catalog (C1): an immutable registry mapping `(type, version)` to
//! a definition carrying its condition/event schemas and required auth.
//! Enumerable, lookup-only, no side effects — adding an entry here is a
//! pure data change, never a control-flow change in C7/C9 (spec.md §9).

pub mod endpoints;

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::json;

use crate::oauth::token::TokenKind;
use crate::scope::ScopeRequirement;
use crate::schema::CompiledSchema;

/// Per-token-kind scope requirement for a subscription. A token kind with no
/// entry is simply not a supported way to create this subscription.
pub struct RequiredAuth {
    entries: Vec<(TokenKind, ScopeRequirement)>,
}

impl RequiredAuth {
    pub fn new(entries: Vec<(TokenKind, ScopeRequirement)>) -> Self {
        Self { entries }
    }

    pub fn for_kind(&self, kind: TokenKind) -> Option<&ScopeRequirement> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, req)| req)
    }
}

pub struct EventDefinition {
    pub event_type: &'static str,
    pub version: &'static str,
    pub condition_schema: CompiledSchema,
    pub event_schema: CompiledSchema,
    pub required_auth: RequiredAuth,
}

/// Key used to look up a definition: `(type, version)`.
pub type EventKey = (&'static str, &'static str);

fn def(
    event_type: &'static str,
    version: &'static str,
    condition_schema: serde_json::Value,
    event_schema: serde_json::Value,
    required_auth: RequiredAuth,
) -> EventDefinition {
    EventDefinition {
        event_type,
        version,
        condition_schema: CompiledSchema::compile(&condition_schema),
        event_schema: CompiledSchema::compile(&event_schema),
        required_auth,
    }
}

static CATALOG: Lazy<HashMap<EventKey, EventDefinition>> = Lazy::new(|| {
    let mut m = HashMap::new();

    m.insert(
        ("channel.follow", "2"),
        def(
            "channel.follow",
            "2",
            json!({
                "type": "object",
                "required": ["broadcaster_user_id", "moderator_user_id"],
                "properties": {
                    "broadcaster_user_id": { "type": "string" },
                    "moderator_user_id": { "type": "string" }
                }
            }),
            json!({
                "type": "object",
                "required": ["user_id", "user_login", "user_name", "broadcaster_user_id", "followed_at"],
                "properties": {
                    "user_id": { "type": "string" },
                    "user_login": { "type": "string" },
                    "user_name": { "type": "string" },
                    "broadcaster_user_id": { "type": "string" },
                    "followed_at": { "type": "string" }
                }
            }),
            RequiredAuth::new(vec![(
                TokenKind::User,
                ScopeRequirement::single(crate::scope::well_known::MODERATOR_READ_FOLLOWERS),
            )]),
        ),
    );

    m.insert(
        ("channel.channel_points_custom_reward_redemption.add", "1"),
        def(
            "channel.channel_points_custom_reward_redemption.add",
            "1",
            json!({
                "type": "object",
                "required": ["broadcaster_user_id"],
                "properties": {
                    "broadcaster_user_id": { "type": "string" },
                    "reward_id": { "type": "string" }
                }
            }),
            json!({
                "type": "object",
                "required": ["id", "user_id", "user_login", "user_name", "broadcaster_user_id", "reward"],
                "properties": {
                    "id": { "type": "string" },
                    "user_id": { "type": "string" },
                    "user_login": { "type": "string" },
                    "user_name": { "type": "string" },
                    "broadcaster_user_id": { "type": "string" },
                    "reward": {
                        "type": "object",
                        "required": ["id", "title", "cost"],
                        "properties": {
                            "id": { "type": "string" },
                            "title": { "type": "string" },
                            "cost": { "type": "integer" }
                        }
                    }
                }
            }),
            RequiredAuth::new(vec![(
                TokenKind::User,
                ScopeRequirement::single(crate::scope::well_known::CHANNEL_READ_REDEMPTIONS),
            )]),
        ),
    );

    m.insert(
        ("channel.chat.message", "1"),
        def(
            "channel.chat.message",
            "1",
            json!({
                "type": "object",
                "required": ["broadcaster_user_id", "user_id"],
                "properties": {
                    "broadcaster_user_id": { "type": "string" },
                    "user_id": { "type": "string" }
                }
            }),
            json!({
                "type": "object",
                "required": ["message_id", "chatter_user_id", "chatter_user_login", "message"],
                "properties": {
                    "message_id": { "type": "string" },
                    "chatter_user_id": { "type": "string" },
                    "chatter_user_login": { "type": "string" },
                    "message": { "type": "object" }
                }
            }),
            RequiredAuth::new(vec![(
                TokenKind::User,
                ScopeRequirement::any_of([
                    ScopeRequirement::single(crate::scope::well_known::USER_READ_CHAT),
                    ScopeRequirement::single(crate::scope::well_known::CHANNEL_BOT),
                ]),
            )]),
        ),
    );

    m.insert(
        ("channel.subscribe", "1"),
        def(
            "channel.subscribe",
            "1",
            json!({
                "type": "object",
                "required": ["broadcaster_user_id"],
                "properties": { "broadcaster_user_id": { "type": "string" } }
            }),
            json!({
                "type": "object",
                "required": ["user_id", "user_login", "broadcaster_user_id", "tier", "is_gift"],
                "properties": {
                    "user_id": { "type": "string" },
                    "user_login": { "type": "string" },
                    "broadcaster_user_id": { "type": "string" },
                    "tier": { "type": "string" },
                    "is_gift": { "type": "boolean" }
                }
            }),
            RequiredAuth::new(vec![(
                TokenKind::User,
                ScopeRequirement::single(crate::scope::well_known::CHANNEL_READ_SUBSCRIPTIONS),
            )]),
        ),
    );

    m.insert(
        ("stream.online", "1"),
        def(
            "stream.online",
            "1",
            json!({
                "type": "object",
                "required": ["broadcaster_user_id"],
                "properties": { "broadcaster_user_id": { "type": "string" } }
            }),
            json!({
                "type": "object",
                "required": ["id", "broadcaster_user_id", "type", "started_at"],
                "properties": {
                    "id": { "type": "string" },
                    "broadcaster_user_id": { "type": "string" },
                    "type": { "type": "string" },
                    "started_at": { "type": "string" }
                }
            }),
            RequiredAuth::new(vec![
                (TokenKind::User, ScopeRequirement::None),
                (TokenKind::App, ScopeRequirement::None),
            ]),
        ),
    );

    m.insert(
        ("stream.offline", "1"),
        def(
            "stream.offline",
            "1",
            json!({
                "type": "object",
                "required": ["broadcaster_user_id"],
                "properties": { "broadcaster_user_id": { "type": "string" } }
            }),
            json!({
                "type": "object",
                "required": ["broadcaster_user_id", "broadcaster_user_login"],
                "properties": {
                    "broadcaster_user_id": { "type": "string" },
                    "broadcaster_user_login": { "type": "string" }
                }
            }),
            RequiredAuth::new(vec![
                (TokenKind::User, ScopeRequirement::None),
                (TokenKind::App, ScopeRequirement::None),
            ]),
        ),
    );

    m
});

/// Looks up a definition by `(type, version)`. The catalog is a
/// representative slice (a handful of entries), so a linear scan over
/// `&str` keys is simpler than fighting `HashMap`'s `Borrow` requirements
/// for a `(&'static str, &'static str)` key.
pub fn lookup(event_type: &str, version: &str) -> Option<&'static EventDefinition> {
    CATALOG
        .iter()
        .find(|((t, v), _)| *t == event_type && *v == version)
        .map(|(_, def)| def)
}

/// Enumerates every registered `(type, version)` pair.
pub fn enumerate() -> impl Iterator<Item = EventKey> {
    CATALOG.keys().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_kind_succeeds() {
        let d = lookup("channel.follow", "2").expect("should be registered");
        assert_eq!(d.event_type, "channel.follow");
    }

    #[test]
    fn lookup_unknown_kind_returns_none() {
        assert!(lookup("channel.does_not_exist", "1").is_none());
    }

    #[test]
    fn enumerate_includes_registered_entries() {
        let all: Vec<_> = enumerate().collect();
        assert!(all.contains(&("channel.chat.message", "1")));
    }

    #[test]
    fn condition_schema_rejects_missing_field() {
        let d = lookup("channel.follow", "2").unwrap();
        assert!(d
            .condition_schema
            .validate(&json!({"broadcaster_user_id": "1"}))
            .is_err());
    }

    #[test]
    fn required_auth_reports_none_for_unsupported_kind() {
        let d = lookup("channel.chat.message", "1").unwrap();
        assert!(d.required_auth.for_kind(TokenKind::App).is_none());
        assert!(d.required_auth.for_kind(TokenKind::User).is_some());
    }
}
