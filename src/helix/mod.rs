//! Helix request pipeline (C7): builds, signs, sends, retries, and
//! validates REST requests; drives the rate-limit manager (C6) and the
//! token provider (C5); surfaces paginated cursors as a lazy sequence.

use std::sync::Arc;

use futures_util::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::catalog::endpoints::{self, EndpointDescriptor};
use crate::error::{Error, Result};
use crate::oauth::provider::TokenSource;
use crate::oauth::token::TokenKind;
use crate::ratelimit::{RateLimitKey, RateLimitManager};

const HELIX_BASE_URL: &str = "https://api.twitch.tv/helix";
/// Network errors and 5xx responses are retried up to this many attempts.
const MAX_RETRIES: u32 = 5;

pub struct HelixClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    rate_limit: Arc<RateLimitManager>,
}

impl HelixClient {
    pub fn new(http: reqwest::Client, client_id: impl Into<String>, rate_limit: Arc<RateLimitManager>) -> Self {
        Self {
            http,
            base_url: HELIX_BASE_URL.trim_end_matches("/helix").to_string(),
            client_id: client_id.into(),
            rate_limit,
        }
    }

    /// Overrides the API base URL (scheme + host), for pointing tests at a
    /// mock server. Endpoint paths already include the `/helix/...` prefix.
    pub fn with_base_url(
        http: reqwest::Client,
        client_id: impl Into<String>,
        rate_limit: Arc<RateLimitManager>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            client_id: client_id.into(),
            rate_limit,
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn rate_limit_key(&self, user_id: Option<&str>) -> RateLimitKey {
        match user_id {
            Some(uid) => RateLimitKey::user(self.client_id.clone(), uid.to_string()),
            None => RateLimitKey::app(self.client_id.clone()),
        }
    }

    /// The full pipeline described in spec.md §4.7, steps 1–8. Step 9
    /// (pagination) is exposed separately by [`HelixClient::paginate`].
    pub async fn call(
        &self,
        endpoint_name: &str,
        query: Option<Value>,
        body: Option<Value>,
        token: &dyn TokenSource,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let endpoint = endpoints::lookup(endpoint_name)
            .ok_or_else(|| Error::Config(format!("unknown endpoint: {endpoint_name}")))?;

        let kind = token.kind().await;
        if !endpoint.allowed_auth.permits(kind) {
            return Err(Error::AuthUnsupported);
        }

        if kind == TokenKind::User {
            let granted = token.scopes().await;
            if !endpoint.required_scope.satisfies(&granted) {
                return Err(Error::ScopeMissing(endpoint.required_scope.clone()));
            }
        }

        if let (Some(schema), Some(q)) = (&endpoint.query_schema, &query) {
            schema
                .validate(q)
                .map_err(|e| Error::BadRequest(format!("query: {e}")))?;
        }
        if let (Some(schema), Some(b)) = (&endpoint.body_schema, &body) {
            schema
                .validate(b)
                .map_err(|e| Error::BadRequest(format!("body: {e}")))?;
        }

        let user_id = if kind == TokenKind::User {
            token.user_id().await
        } else {
            None
        };
        let rl_key = self.rate_limit_key(user_id.as_deref());
        self.rate_limit.acquire(&rl_key, cancel).await?;

        self.send_with_retries(endpoint, query, body, token, &rl_key, cancel).await
    }

    async fn send_with_retries(
        &self,
        endpoint: &EndpointDescriptor,
        query: Option<Value>,
        body: Option<Value>,
        token: &dyn TokenSource,
        rl_key: &RateLimitKey,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut backoff = Backoff::helix_default();
        let mut retried_401 = false;
        let mut retried_429 = false;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let access_token = token.get_access_token().await?;
            let send_result = self
                .send_once(endpoint, query.as_ref(), body.as_ref(), &access_token.access_token)
                .await;

            let resp = match send_result {
                Ok(r) => r,
                Err(e) => {
                    if backoff.attempt() >= MAX_RETRIES {
                        return Err(Error::Transport(format!("helix {} failed: {e}", endpoint.name)));
                    }
                    warn!(endpoint = endpoint.name, error = %e, "helix send failed, retrying");
                    self.sleep_or_cancel(backoff.next_delay(), cancel).await?;
                    continue;
                }
            };

            let status = resp.status().as_u16();
            self.rate_limit.update_from_headers(rl_key, resp.headers()).await;

            if status == 401 {
                if retried_401 {
                    return Err(Error::InvalidToken);
                }
                retried_401 = true;
                debug!(endpoint = endpoint.name, "401 received, forcing token refresh and retrying once");
                token.force_refresh().await?;
                continue;
            }

            if status == 429 {
                if retried_429 {
                    return Err(Error::RateLimited);
                }
                retried_429 = true;
                let reset = resp
                    .headers()
                    .get("ratelimit-reset")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok());
                match reset {
                    Some(reset_epoch) => {
                        self.rate_limit.note_429(rl_key, reset_epoch).await;
                        self.rate_limit.acquire(rl_key, cancel).await?;
                        continue;
                    }
                    None => return Err(Error::RateLimited),
                }
            }

            let body_text = resp.text().await?;

            if endpoint.success_codes.contains(&status) {
                if body_text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                let json: Value = serde_json::from_str(&body_text)?;
                endpoint.response_schema.validate(&json)?;
                return Ok(json);
            }

            if (500..600).contains(&status) {
                if backoff.attempt() >= MAX_RETRIES {
                    return Err(Error::Transport(format!(
                        "helix {} failed after retries: {status} {body_text}",
                        endpoint.name
                    )));
                }
                warn!(endpoint = endpoint.name, status, "helix 5xx, retrying");
                self.sleep_or_cancel(backoff.next_delay(), cancel).await?;
                continue;
            }

            if endpoint.known_error_codes.contains(&status) {
                return Err(Error::Helix {
                    status,
                    message: body_text,
                });
            }

            return Err(Error::Transport(format!(
                "unexpected status from helix {}: {status} {body_text}",
                endpoint.name
            )));
        }
    }

    async fn sleep_or_cancel(&self, delay: std::time::Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn send_once(
        &self,
        endpoint: &EndpointDescriptor,
        query: Option<&Value>,
        body: Option<&Value>,
        bearer: &str,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let mut req = self
            .http
            .request(endpoint.method.as_reqwest(), self.url_for(endpoint.path))
            .header("Client-Id", &self.client_id)
            .header("Authorization", format!("Bearer {bearer}"));

        if let Some(q) = query {
            req = req.query(&value_as_query_pairs(q));
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        req.send().await
    }

    /// Step 9: exposes a lazy, cancellable sequence over a cursor-paginated
    /// endpoint. Each item re-invokes the pipeline from step 4 onward with
    /// `after=<cursor>` until the server stops returning one.
    pub fn paginate<'a>(
        &'a self,
        endpoint_name: &'a str,
        mut query: Value,
        token: &'a dyn TokenSource,
        cancel: &'a CancellationToken,
    ) -> impl Stream<Item = Result<Value>> + 'a {
        async_stream::try_stream! {
            let mut cursor: Option<String> = None;
            loop {
                if let Some(c) = &cursor {
                    query["after"] = Value::String(c.clone());
                } else if let Some(obj) = query.as_object_mut() {
                    obj.remove("after");
                }

                let page = self.call(endpoint_name, Some(query.clone()), None, token, cancel).await?;
                let next_cursor = page
                    .get("pagination")
                    .and_then(|p| p.get("cursor"))
                    .and_then(|c| c.as_str())
                    .map(str::to_string);

                yield page;

                match next_cursor {
                    Some(c) => cursor = Some(c),
                    None => break,
                }
            }
        }
    }
}

fn value_as_query_pairs(v: &Value) -> Vec<(String, String)> {
    match v.as_object() {
        Some(obj) => obj
            .iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k.clone(), s.clone())),
                Value::Number(n) => Some((k.clone(), n.to_string())),
                Value::Bool(b) => Some((k.clone(), b.to_string())),
                _ => None,
            })
            .collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::flows::ClientCredentialsFlow;
    use crate::oauth::provider::TokenProvider;
    use crate::oauth::token::AccessToken;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app_provider() -> Arc<TokenProvider<ClientCredentialsFlow>> {
        let flow = Arc::new(ClientCredentialsFlow::new("cid", "secret"));
        TokenProvider::new(flow, reqwest::Client::new(), AccessToken::new_app("AT".into(), Duration::from_secs(3600)))
    }

    #[tokio::test]
    async fn get_users_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .and(header("Client-Id", "cid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "1", "login": "x", "display_name": "X"}]
            })))
            .mount(&server)
            .await;

        let rl = Arc::new(RateLimitManager::new());
        let client = HelixClient::with_base_url(reqwest::Client::new(), "cid", rl, server.uri());
        let provider = app_provider();
        let cancel = CancellationToken::new();

        let resp = client
            .call("get_users", Some(json!({})), None, provider.as_ref(), &cancel)
            .await
            .unwrap();
        assert_eq!(resp["data"][0]["id"], "1");
    }

    #[tokio::test]
    async fn unknown_endpoint_is_rejected() {
        let rl = Arc::new(RateLimitManager::new());
        let client = HelixClient::new(reqwest::Client::new(), "cid", rl);
        let provider = app_provider();
        let cancel = CancellationToken::new();
        let err = client
            .call("does_not_exist", None, None, provider.as_ref(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn app_token_cannot_call_user_only_endpoint() {
        let rl = Arc::new(RateLimitManager::new());
        let client = HelixClient::new(reqwest::Client::new(), "cid", rl);
        let provider = app_provider();
        let cancel = CancellationToken::new();
        let err = client
            .call(
                "send_chat_message",
                None,
                Some(json!({"broadcaster_id": "1", "sender_id": "1", "message": "hi"})),
                provider.as_ref(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthUnsupported));
    }

    #[tokio::test]
    async fn retries_401_once_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let rl = Arc::new(RateLimitManager::new());
        let client = HelixClient::with_base_url(reqwest::Client::new(), "cid", rl, server.uri());
        let provider = app_provider();
        let cancel = CancellationToken::new();

        let err = client
            .call("get_users", Some(json!({})), None, provider.as_ref(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidToken));
    }

    #[tokio::test]
    async fn known_error_code_surfaces_as_helix_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let rl = Arc::new(RateLimitManager::new());
        let client = HelixClient::with_base_url(reqwest::Client::new(), "cid", rl, server.uri());
        let provider = app_provider();
        let cancel = CancellationToken::new();

        let err = client
            .call("get_users", Some(json!({})), None, provider.as_ref(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Helix { status: 400, .. }));
    }
}
