//! Client facade (C10): the crate's entry point, built the way the
//! teacher assembles `Config`/`AppState` in `main.rs` — a builder with
//! typed, overridable fields that produces one long-lived handle owning
//! the HTTP client, the rate limiter, and a pool of live C8 sessions keyed
//! by `(user_id, client_id)` so subscriptions for the same identity share
//! a socket (spec.md §4.9 step 4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};
use crate::helix::HelixClient;
use crate::oauth::provider::TokenSource;
use crate::ratelimit::RateLimitManager;
use crate::subscription::{self, Subscription};
use crate::ws::transport::{Dialer, TungsteniteDialer};
use crate::ws::Session;

const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv/helix";
const DEFAULT_EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
const DEFAULT_USER_AGENT: &str = concat!("twitch_eventsub/", env!("CARGO_PKG_VERSION"));
const DEFAULT_SEEN_MESSAGE_CAPACITY: usize = 64;
const DEFAULT_KEEPALIVE_SLACK: Duration = Duration::from_secs(5);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ClientBuilder {
    client_id: String,
    user_agent: String,
    helix_base_url: String,
    eventsub_ws_url: String,
    http_timeout: Duration,
    seen_message_capacity: usize,
    keepalive_slack: Duration,
    dialer: Option<Arc<dyn Dialer>>,
}

impl ClientBuilder {
    fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            helix_base_url: DEFAULT_HELIX_BASE_URL.to_string(),
            eventsub_ws_url: DEFAULT_EVENTSUB_WS_URL.to_string(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            seen_message_capacity: DEFAULT_SEEN_MESSAGE_CAPACITY,
            keepalive_slack: DEFAULT_KEEPALIVE_SLACK,
            dialer: None,
        }
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn helix_base_url(mut self, url: impl Into<String>) -> Self {
        self.helix_base_url = url.into();
        self
    }

    pub fn eventsub_ws_url(mut self, url: impl Into<String>) -> Self {
        self.eventsub_ws_url = url.into();
        self
    }

    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Clamped to at least 64, per spec.md's dedup buffer floor.
    pub fn seen_message_capacity(mut self, capacity: usize) -> Self {
        self.seen_message_capacity = capacity.max(64);
        self
    }

    pub fn keepalive_slack(mut self, slack: Duration) -> Self {
        self.keepalive_slack = slack;
        self
    }

    /// Test-only hook: inject a [`Dialer`] other than the production
    /// `tokio-tungstenite`-backed one.
    #[doc(hidden)]
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn build(self) -> Result<TwitchClient> {
        if self.client_id.is_empty() {
            return Err(Error::Config("client_id must not be empty".into()));
        }
        let http = reqwest::Client::builder()
            .user_agent(self.user_agent)
            .timeout(self.http_timeout)
            .build()
            .map_err(Error::Http)?;

        let rate_limit = Arc::new(RateLimitManager::new());
        let helix = Arc::new(HelixClient::with_base_url(
            http.clone(),
            self.client_id.clone(),
            rate_limit,
            self.helix_base_url,
        ));
        let dialer = self.dialer.unwrap_or_else(|| Arc::new(TungsteniteDialer));

        Ok(TwitchClient {
            helix,
            eventsub_ws_url: self.eventsub_ws_url,
            seen_message_capacity: self.seen_message_capacity,
            keepalive_slack: self.keepalive_slack,
            dialer,
            sessions: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }
}

/// Owns everything needed to subscribe to EventSub events and make Helix
/// calls for a single application identity (`client_id`).
pub struct TwitchClient {
    helix: Arc<HelixClient>,
    eventsub_ws_url: String,
    seen_message_capacity: usize,
    keepalive_slack: Duration,
    dialer: Arc<dyn Dialer>,
    sessions: Mutex<HashMap<(String, String), Arc<Session>>>,
    cancel: CancellationToken,
}

impl TwitchClient {
    pub fn builder(client_id: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(client_id)
    }

    /// Subscribes to `event_type`/`version` under the identity carried by
    /// `token`, reusing an existing session for that identity if one is
    /// already connected. `cancel` governs only the subscription-creation
    /// call itself (like the `token` argument on `get_users` and friends);
    /// pass `None` to fall back to a child of the client's own token.
    /// `Subscription::cancel()` remains the way to tear down the
    /// subscription once it exists.
    pub async fn subscribe(
        &self,
        event_type: &'static str,
        version: &'static str,
        condition: Value,
        token: Arc<dyn TokenSource>,
        cancel: Option<CancellationToken>,
    ) -> Result<Subscription> {
        let session = self.session_for(&token).await?;
        subscription::subscribe(
            event_type,
            version,
            condition,
            token,
            Arc::clone(&self.helix),
            session,
            cancel.unwrap_or_else(|| self.cancel.child_token()),
        )
        .await
    }

    async fn session_for(&self, token: &Arc<dyn TokenSource>) -> Result<Arc<Session>> {
        let user_id = token.user_id().await.unwrap_or_default();
        let key = (user_id, token.client_id().to_string());

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&key) {
            return Ok(Arc::clone(session));
        }

        info!(eventsub_ws_url = %self.eventsub_ws_url, "opening eventsub session");
        let session = Session::connect(
            Arc::clone(&self.dialer),
            Arc::clone(&self.helix),
            Arc::clone(token),
            self.eventsub_ws_url.clone(),
            self.seen_message_capacity,
            self.keepalive_slack,
            self.cancel.child_token(),
        )
        .await?;
        sessions.insert(key, Arc::clone(&session));
        Ok(session)
    }

    pub async fn get_users(&self, query: Value, token: &dyn TokenSource) -> Result<Value> {
        self.helix
            .call("get_users", Some(query), None, token, &self.cancel)
            .await
    }

    pub async fn create_eventsub_subscription(&self, body: Value, token: &dyn TokenSource) -> Result<Value> {
        self.helix
            .call("create_eventsub_subscription", None, Some(body), token, &self.cancel)
            .await
    }

    pub async fn delete_eventsub_subscription(&self, subscription_id: &str, token: &dyn TokenSource) -> Result<Value> {
        self.helix
            .call(
                "delete_eventsub_subscription",
                Some(serde_json::json!({ "id": subscription_id })),
                None,
                token,
                &self.cancel,
            )
            .await
    }

    pub fn list_eventsub_subscriptions<'a>(
        &'a self,
        query: Value,
        token: &'a dyn TokenSource,
    ) -> impl Stream<Item = Result<Value>> + 'a {
        self.helix.paginate("list_eventsub_subscriptions", query, token, &self.cancel)
    }

    /// Cancels every in-flight Helix call and EventSub session owned by
    /// this client.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_client_id_is_rejected() {
        let err = TwitchClient::builder("").build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn defaults_are_applied() {
        let client = TwitchClient::builder("cid").build().unwrap();
        assert_eq!(client.eventsub_ws_url, DEFAULT_EVENTSUB_WS_URL);
        assert_eq!(client.seen_message_capacity, DEFAULT_SEEN_MESSAGE_CAPACITY);
    }

    #[test]
    fn seen_message_capacity_is_clamped_to_floor() {
        let client = TwitchClient::builder("cid").seen_message_capacity(4).build().unwrap();
        assert_eq!(client.seen_message_capacity, 64);
    }
}
