//! Subscription lifecycle (C9): creates an EventSub subscription against a
//! live [`crate::ws::Session`] and exposes it as a lazy, pull-based sequence
//! of already-validated events, following the Helix pagination streams in
//! `helix/mod.rs` for the "pull, don't push" shape (spec.md §4.9).

use std::sync::Arc;

use futures_util::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::{self, EventDefinition};
use crate::error::{Error, Result};
use crate::helix::HelixClient;
use crate::oauth::provider::TokenSource;
use crate::ws::{RoutedEvent, Session};

/// Creates the subscription and registers its delivery queue with `session`.
/// `session` is reference-counted by the caller's session pool (C10); this
/// function increments that count on success and decrements it when the
/// returned [`Subscription`] is torn down.
pub async fn subscribe(
    event_type: &'static str,
    version: &'static str,
    condition: Value,
    token: Arc<dyn TokenSource>,
    helix: Arc<HelixClient>,
    session: Arc<Session>,
    cancel: CancellationToken,
) -> Result<Subscription> {
    let def = catalog::lookup(event_type, version)
        .ok_or_else(|| Error::UnknownKind(event_type.to_string(), version.to_string()))?;

    def.condition_schema.validate(&condition)?;

    let kind = token.kind().await;
    let requirement = def
        .required_auth
        .for_kind(kind)
        .ok_or(Error::AuthUnsupported)?;
    let granted = token.scopes().await;
    if !requirement.satisfies(&granted) {
        return Err(Error::ScopeMissing(requirement.clone()));
    }

    session.incr_ref();

    match create_subscription(def, condition, &token, &helix, &session, &cancel).await {
        Ok((subscription_id, route_rx)) => Ok(Subscription {
            receiver: route_rx,
            event_schema: &def.event_schema,
            teardown: Some(Teardown {
                session,
                helix,
                token,
                subscription_id,
                cancel,
            }),
            terminated: false,
        }),
        Err(e) => {
            if session.decr_ref() == 0 {
                session.shutdown();
            }
            Err(e)
        }
    }
}

async fn create_subscription(
    def: &'static EventDefinition,
    condition: Value,
    token: &Arc<dyn TokenSource>,
    helix: &Arc<HelixClient>,
    session: &Arc<Session>,
    cancel: &CancellationToken,
) -> Result<(String, mpsc::Receiver<RoutedEvent>)> {
    let session_id = session
        .session_id()
        .await
        .ok_or_else(|| Error::Protocol("session has no active session id yet".into()))?;

    let body = json!({
        "type": def.event_type,
        "version": def.version,
        "condition": condition,
        "transport": { "method": "websocket", "session_id": session_id },
    });

    let response = helix
        .call(
            "create_eventsub_subscription",
            None,
            Some(body),
            token.as_ref(),
            cancel,
        )
        .await?;

    let subscription_id = response
        .get("data")
        .and_then(|d| d.get(0))
        .and_then(|s| s.get("id"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Protocol("create subscription response missing id".into()))?;

    let (route_tx, route_rx) = mpsc::channel(32);
    session
        .register(
            subscription_id.clone(),
            def.event_type.to_string(),
            def.version.to_string(),
            condition,
            route_tx,
        )
        .await;

    Ok((subscription_id, route_rx))
}

struct Teardown {
    session: Arc<Session>,
    helix: Arc<HelixClient>,
    token: Arc<dyn TokenSource>,
    subscription_id: String,
    cancel: CancellationToken,
}

impl Teardown {
    async fn run(self) {
        self.session.unregister(&self.subscription_id).await;
        let result = self
            .helix
            .call(
                "delete_eventsub_subscription",
                Some(json!({ "id": self.subscription_id })),
                None,
                self.token.as_ref(),
                &self.cancel,
            )
            .await;
        if let Err(e) = result {
            debug!(error = ?e, subscription_id = %self.subscription_id, "best-effort subscription delete failed");
        }
        if self.session.decr_ref() == 0 {
            self.session.shutdown();
        }
    }
}

/// A single event subscription's delivery stream. Each yielded item has
/// already passed the catalog's event schema for this `(type, version)`.
/// The stream ends after a `revocation` frame, surfaced as a final
/// `Err(Error::Revoked(reason))`, or after the caller drops/cancels it.
pub struct Subscription {
    receiver: mpsc::Receiver<RoutedEvent>,
    event_schema: &'static crate::schema::CompiledSchema,
    teardown: Option<Teardown>,
    terminated: bool,
}

impl Subscription {
    /// Cancels the subscription: unregisters its route, best-effort deletes
    /// it on Helix, and releases the session reference. Safe to call more
    /// than once or to skip — dropping the `Subscription` has the same
    /// effect via its `Drop` impl, just without the delete call.
    pub async fn cancel(mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown.run().await;
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> {
        async_stream::try_stream! {
            let mut this = self;
            loop {
                let Some(event) = this.receiver.recv().await else {
                    break;
                };
                match event {
                    RoutedEvent::Notification(payload) => {
                        if let Err(e) = this.event_schema.validate(&payload) {
                            warn!(error = ?e, "notification failed event schema validation, dropping");
                            continue;
                        }
                        yield payload;
                    }
                    RoutedEvent::Revoked(reason) => {
                        this.terminated = true;
                        Err(Error::Revoked(reason))?;
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            tokio::spawn(async move { teardown.run().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::flows::ClientCredentialsFlow;
    use crate::oauth::provider::TokenProvider;
    use crate::oauth::token::AccessToken;
    use crate::ratelimit::RateLimitManager;
    use crate::ws::transport::fake::{FakeDialer, FakeTransport};
    use futures_util::StreamExt;
    use std::time::Duration;

    fn welcome_frame(id: &str) -> String {
        format!(
            r#"{{"metadata":{{"message_id":"w-{id}","message_type":"session_welcome"}},"payload":{{"session":{{"id":"{id}","status":"connected","keepalive_timeout_seconds":10,"reconnect_url":null}}}}}}"#
        )
    }

    async fn app_token() -> Arc<dyn TokenSource> {
        let flow = Arc::new(ClientCredentialsFlow::new("cid", "secret"));
        TokenProvider::new(
            flow,
            reqwest::Client::new(),
            AccessToken::new_app("AT".into(), Duration::from_secs(3600)),
        )
    }

    #[tokio::test]
    async fn unknown_event_type_is_rejected() {
        let dialer = Arc::new(FakeDialer::new());
        let (tx, transport) = FakeTransport::new();
        dialer.push(transport).await;
        tx.send(welcome_frame("S1")).unwrap();

        let helix = Arc::new(HelixClient::new(reqwest::Client::new(), "cid", Arc::new(RateLimitManager::new())));
        let session = Session::connect(
            dialer,
            helix.clone(),
            app_token().await,
            "wss://example/ws",
            64,
            Duration::from_millis(50),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let err = subscribe(
            "not.a.real.event",
            "1",
            json!({}),
            app_token().await,
            helix,
            session,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::UnknownKind(_, _)));
    }

    #[tokio::test]
    async fn app_token_cannot_subscribe_to_user_only_event() {
        let dialer = Arc::new(FakeDialer::new());
        let (tx, transport) = FakeTransport::new();
        dialer.push(transport).await;
        tx.send(welcome_frame("S1")).unwrap();

        let helix = Arc::new(HelixClient::new(reqwest::Client::new(), "cid", Arc::new(RateLimitManager::new())));
        let session = Session::connect(
            dialer,
            helix.clone(),
            app_token().await,
            "wss://example/ws",
            64,
            Duration::from_millis(50),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let err = subscribe(
            "channel.chat.message",
            "1",
            json!({"broadcaster_user_id": "1", "user_id": "2"}),
            app_token().await,
            helix,
            session,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::AuthUnsupported));
    }

    #[tokio::test]
    async fn invalid_condition_is_rejected_before_any_network_call() {
        let dialer = Arc::new(FakeDialer::new());
        let (tx, transport) = FakeTransport::new();
        dialer.push(transport).await;
        tx.send(welcome_frame("S1")).unwrap();

        let helix = Arc::new(HelixClient::new(reqwest::Client::new(), "cid", Arc::new(RateLimitManager::new())));
        let session = Session::connect(
            dialer,
            helix.clone(),
            app_token().await,
            "wss://example/ws",
            64,
            Duration::from_millis(50),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let err = subscribe(
            "stream.online",
            "1",
            json!({}),
            app_token().await,
            helix,
            session,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
