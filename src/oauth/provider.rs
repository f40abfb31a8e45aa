//! Token provider (C5): caches the current token, validates hourly, and
//! refreshes on expiry or invalidation. Single-threaded cooperative per
//! instance (spec.md §5) — realized here as one `tokio::sync::Mutex`
//! guarding all cached state, which gives concurrent `validate()` callers
//! single-flight behaviour for free (spec.md §8 property 5).

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::oauth::flows::Refreshable;
use crate::oauth::token::{AccessToken, TokenKind};
use crate::scope::Scope;

const VALIDATE_ENDPOINT: &str = "https://id.twitch.tv/oauth2/validate";
/// Twitch requires at least hourly validation of user tokens (spec.md §4.5).
const VALIDATION_CADENCE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    client_id: String,
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    expires_in: Option<u64>,
}

struct State {
    token: AccessToken,
    last_validated_at: Option<Instant>,
}

pub struct TokenProvider<F> {
    flow: Arc<F>,
    http: reqwest::Client,
    validate_url: String,
    state: Mutex<State>,
}

impl<F: Refreshable + 'static> TokenProvider<F> {
    pub fn new(flow: Arc<F>, http: reqwest::Client, initial: AccessToken) -> Arc<Self> {
        Arc::new(Self {
            flow,
            http,
            validate_url: VALIDATE_ENDPOINT.to_string(),
            state: Mutex::new(State {
                token: initial,
                last_validated_at: None,
            }),
        })
    }

    /// Overrides the validate endpoint, for pointing tests at a mock server.
    pub fn with_validate_url(flow: Arc<F>, http: reqwest::Client, initial: AccessToken, validate_url: String) -> Arc<Self> {
        Arc::new(Self {
            flow,
            http,
            validate_url,
            state: Mutex::new(State {
                token: initial,
                last_validated_at: None,
            }),
        })
    }

    pub fn client_id(&self) -> &str {
        self.flow.client_id()
    }

    /// Returns a currently-usable token, refreshing if necessary.
    pub async fn get_access_token(&self) -> Result<AccessToken> {
        let mut state = self.state.lock().await;
        if state.token.is_usable() {
            return Ok(state.token.clone());
        }

        self.refresh_locked(&mut state).await?;
        Ok(state.token.clone())
    }

    /// Forces a refresh via the flow. Fails if the flow refuses.
    pub async fn refresh(&self) -> Result<AccessToken> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await?;
        Ok(state.token.clone())
    }

    async fn refresh_locked(&self, state: &mut State) -> Result<()> {
        if !self.flow.can_refresh(&state.token) {
            return Err(Error::Config(
                "this token flow does not support refresh".into(),
            ));
        }
        let fresh = self.flow.refresh(&self.http, &state.token).await?;
        info!(client_id = %self.flow.client_id(), "refreshed access token");
        state.token = fresh;
        state.last_validated_at = None;
        Ok(())
    }

    /// Validates the cached token if the last validation is older than an
    /// hour or unknown. App tokens skip the validation endpoint entirely and
    /// rely solely on the expiry instant.
    pub async fn validate(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.token.kind == TokenKind::App {
            return Ok(());
        }
        if let Some(last) = state.last_validated_at {
            if last.elapsed() < VALIDATION_CADENCE {
                debug!("validation cache still fresh, skipping network round-trip");
                return Ok(());
            }
        }

        let access_token = state.token.access_token.clone();
        let resp = self
            .http
            .get(&self.validate_url)
            .header("Authorization", format!("Bearer {access_token}"))
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                warn!(error = ?e, "token validation request failed");
                return Err(Error::Http(e));
            }
        };

        if !resp.status().is_success() {
            state.token.validation_failed = true;
            return Err(Error::InvalidToken);
        }

        let body: ValidateResponse = resp.json().await?;
        if body.client_id != self.flow.client_id() {
            warn!(
                expected = %self.flow.client_id(),
                got = %body.client_id,
                "validation client_id mismatch; invalidating token"
            );
            state.token.validation_failed = true;
            return Err(Error::InvalidToken);
        }

        state.token.validation_failed = false;
        state.token.user_id = body.user_id;
        state.token.scopes = body.scopes.into_iter().map(Scope::new).collect();
        state.last_validated_at = Some(Instant::now());
        Ok(())
    }

    /// Returns the user id of the last successful validation, if any.
    pub async fn user_id(&self) -> Option<String> {
        self.state.lock().await.token.user_id.clone()
    }

    pub async fn scopes(&self) -> std::collections::HashSet<Scope> {
        self.state.lock().await.token.scopes.clone()
    }

    /// Schedules `validate()` every hour; returns a handle whose `cancel()`
    /// stops the loop.
    pub fn start_periodic_validation(self: &Arc<Self>) -> PeriodicValidationHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(VALIDATION_CADENCE) => {}
                }
                if let Err(e) = provider.validate().await {
                    warn!(error = ?e, "periodic token validation failed");
                }
            }
        });
        PeriodicValidationHandle { cancel: token }
    }
}

pub struct PeriodicValidationHandle {
    cancel: CancellationToken,
}

impl PeriodicValidationHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Object-safe view of a token provider, so the Helix client (C7) and the
/// subscription layer (C9) can depend on "a source of tokens" without being
/// generic over which flow backs it.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    fn client_id(&self) -> &str;
    async fn get_access_token(&self) -> Result<AccessToken>;
    async fn force_refresh(&self) -> Result<AccessToken>;
    async fn scopes(&self) -> std::collections::HashSet<Scope>;
    async fn user_id(&self) -> Option<String>;
    async fn kind(&self) -> TokenKind;
}

#[async_trait::async_trait]
impl<F: Refreshable + 'static> TokenSource for TokenProvider<F> {
    fn client_id(&self) -> &str {
        TokenProvider::client_id(self)
    }

    async fn get_access_token(&self) -> Result<AccessToken> {
        TokenProvider::get_access_token(self).await
    }

    async fn force_refresh(&self) -> Result<AccessToken> {
        TokenProvider::refresh(self).await
    }

    async fn scopes(&self) -> std::collections::HashSet<Scope> {
        TokenProvider::scopes(self).await
    }

    async fn user_id(&self) -> Option<String> {
        TokenProvider::user_id(self).await
    }

    async fn kind(&self) -> TokenKind {
        self.state.lock().await.token.kind
    }
}
