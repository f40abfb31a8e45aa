//! Endpoint catalog (C2): a closed registry of REST endpoint descriptors
//! consumed by the Helix client (C7). No descriptor embeds networking
//! logic — it is pure data.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::json;

use crate::scope::ScopeRequirement;
use crate::schema::CompiledSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedAuth {
    AppOnly,
    UserOnly,
    Either,
}

impl AllowedAuth {
    pub fn permits(self, kind: crate::oauth::token::TokenKind) -> bool {
        use crate::oauth::token::TokenKind::*;
        matches!(
            (self, kind),
            (AllowedAuth::Either, _) | (AllowedAuth::AppOnly, App) | (AllowedAuth::UserOnly, User)
        )
    }
}

pub struct EndpointDescriptor {
    pub name: &'static str,
    pub method: HttpMethod,
    pub path: &'static str,
    pub query_schema: Option<CompiledSchema>,
    pub body_schema: Option<CompiledSchema>,
    pub response_schema: CompiledSchema,
    pub success_codes: &'static [u16],
    pub known_error_codes: &'static [u16],
    pub allowed_auth: AllowedAuth,
    pub required_scope: ScopeRequirement,
    /// Whether a success response carries a `pagination.cursor`.
    pub paginated: bool,
}

fn empty_schema() -> serde_json::Value {
    json!({})
}

static ENDPOINTS: Lazy<HashMap<&'static str, EndpointDescriptor>> = Lazy::new(|| {
    let mut m = HashMap::new();

    m.insert(
        "create_eventsub_subscription",
        EndpointDescriptor {
            name: "create_eventsub_subscription",
            method: HttpMethod::Post,
            path: "/helix/eventsub/subscriptions",
            query_schema: None,
            body_schema: Some(CompiledSchema::compile(&json!({
                "type": "object",
                "required": ["type", "version", "condition", "transport"],
                "properties": {
                    "type": { "type": "string" },
                    "version": { "type": "string" },
                    "condition": { "type": "object" },
                    "transport": {
                        "type": "object",
                        "required": ["method", "session_id"],
                        "properties": {
                            "method": { "const": "websocket" },
                            "session_id": { "type": "string" }
                        }
                    }
                }
            }))),
            response_schema: CompiledSchema::compile(&json!({
                "type": "object",
                "required": ["data"],
                "properties": { "data": { "type": "array" } }
            })),
            success_codes: &[202],
            known_error_codes: &[400, 401, 403, 409, 429],
            allowed_auth: AllowedAuth::Either,
            required_scope: ScopeRequirement::None,
            paginated: false,
        },
    );

    m.insert(
        "delete_eventsub_subscription",
        EndpointDescriptor {
            name: "delete_eventsub_subscription",
            method: HttpMethod::Delete,
            path: "/helix/eventsub/subscriptions",
            query_schema: Some(CompiledSchema::compile(&json!({
                "type": "object",
                "required": ["id"],
                "properties": { "id": { "type": "string" } }
            }))),
            body_schema: None,
            response_schema: CompiledSchema::compile(&empty_schema()),
            success_codes: &[204],
            known_error_codes: &[400, 401, 404, 429],
            allowed_auth: AllowedAuth::Either,
            required_scope: ScopeRequirement::None,
            paginated: false,
        },
    );

    m.insert(
        "list_eventsub_subscriptions",
        EndpointDescriptor {
            name: "list_eventsub_subscriptions",
            method: HttpMethod::Get,
            path: "/helix/eventsub/subscriptions",
            query_schema: Some(CompiledSchema::compile(&json!({ "type": "object" }))),
            body_schema: None,
            response_schema: CompiledSchema::compile(&json!({
                "type": "object",
                "required": ["data"],
                "properties": {
                    "data": { "type": "array" },
                    "pagination": { "type": "object" }
                }
            })),
            success_codes: &[200],
            known_error_codes: &[400, 401, 429],
            allowed_auth: AllowedAuth::Either,
            required_scope: ScopeRequirement::None,
            paginated: true,
        },
    );

    m.insert(
        "get_users",
        EndpointDescriptor {
            name: "get_users",
            method: HttpMethod::Get,
            path: "/helix/users",
            query_schema: Some(CompiledSchema::compile(&json!({ "type": "object" }))),
            body_schema: None,
            response_schema: CompiledSchema::compile(&json!({
                "type": "object",
                "required": ["data"],
                "properties": { "data": { "type": "array" } }
            })),
            success_codes: &[200],
            known_error_codes: &[400, 401],
            allowed_auth: AllowedAuth::Either,
            required_scope: ScopeRequirement::None,
            paginated: false,
        },
    );

    m.insert(
        "send_chat_message",
        EndpointDescriptor {
            name: "send_chat_message",
            method: HttpMethod::Post,
            path: "/helix/chat/messages",
            query_schema: None,
            body_schema: Some(CompiledSchema::compile(&json!({
                "type": "object",
                "required": ["broadcaster_id", "sender_id", "message"],
                "properties": {
                    "broadcaster_id": { "type": "string" },
                    "sender_id": { "type": "string" },
                    "message": { "type": "string" }
                }
            }))),
            response_schema: CompiledSchema::compile(&json!({
                "type": "object",
                "required": ["data"],
                "properties": { "data": { "type": "array" } }
            })),
            success_codes: &[200],
            known_error_codes: &[400, 401, 403, 429],
            allowed_auth: AllowedAuth::UserOnly,
            required_scope: ScopeRequirement::any_of([
                ScopeRequirement::single(crate::scope::well_known::USER_BOT),
                ScopeRequirement::single(crate::scope::well_known::CHANNEL_BOT),
            ]),
            paginated: false,
        },
    );

    m
});

pub fn lookup(name: &str) -> Option<&'static EndpointDescriptor> {
    ENDPOINTS.get(name)
}

pub fn enumerate() -> impl Iterator<Item = &'static str> {
    ENDPOINTS.keys().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_endpoint() {
        let d = lookup("get_users").expect("registered");
        assert_eq!(d.method, HttpMethod::Get);
    }

    #[test]
    fn allowed_auth_permits_matches_kind() {
        use crate::oauth::token::TokenKind;
        assert!(AllowedAuth::Either.permits(TokenKind::App));
        assert!(AllowedAuth::Either.permits(TokenKind::User));
        assert!(AllowedAuth::AppOnly.permits(TokenKind::App));
        assert!(!AllowedAuth::AppOnly.permits(TokenKind::User));
        assert!(AllowedAuth::UserOnly.permits(TokenKind::User));
        assert!(!AllowedAuth::UserOnly.permits(TokenKind::App));
    }

    #[test]
    fn create_subscription_body_schema_rejects_bad_transport() {
        let d = lookup("create_eventsub_subscription").unwrap();
        let schema = d.body_schema.as_ref().unwrap();
        let bad = json!({
            "type": "channel.follow",
            "version": "2",
            "condition": {},
            "transport": { "method": "webhook", "session_id": "x" }
        });
        assert!(schema.validate(&bad).is_err());
    }
}
