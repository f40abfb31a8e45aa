//! Token flow strategies (C4): implicit, authorization-code, device-code,
//! client-credentials. Each is split into pure steps — build URL / parse
//! fragment / exchange / refresh / poll — rather than runtime-detected
//! browser-vs-server branches (spec.md §9).

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};
use crate::oauth::token::AccessToken;
use crate::scope::Scope;

const AUTHORIZE_ENDPOINT: &str = "https://id.twitch.tv/oauth2/authorize";
const TOKEN_ENDPOINT: &str = "https://id.twitch.tv/oauth2/token";
const DEVICE_ENDPOINT: &str = "https://id.twitch.tv/oauth2/device";

/// Raw token endpoint response, shared by every flow. Twitch always
/// returns `token_type: "bearer"`; anything else is a protocol error.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
    token_type: String,
    #[serde(default)]
    scope: Vec<String>,
}

fn parse_scopes(scope: Vec<String>) -> HashSet<Scope> {
    scope.into_iter().map(Scope::new).collect()
}

fn require_bearer(resp: TokenResponse) -> Result<TokenResponse> {
    if resp.token_type.eq_ignore_ascii_case("bearer") {
        Ok(resp)
    } else {
        Err(Error::Protocol(format!(
            "unexpected token_type: {}",
            resp.token_type
        )))
    }
}

/// Common contract every flow implements (spec.md §4.4 table).
pub trait TokenFlow {
    fn client_id(&self) -> &str;
    fn can_refresh(&self, token: &AccessToken) -> bool;
}

// --- Implicit flow ---------------------------------------------------------

pub struct ImplicitFlow {
    pub client_id: String,
    pub redirect_uri: String,
}

impl ImplicitFlow {
    pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
        }
    }

    /// Builds the authorize URL. Universal (no browser required to build it).
    pub fn build_authorize_url(&self, scopes: &[&str], state: &str, force_verify: bool) -> Result<String> {
        let mut url = Url::parse(AUTHORIZE_ENDPOINT)?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("response_type", "token")
                .append_pair("scope", &scopes.join(" "))
                .append_pair("state", state);
            if force_verify {
                qp.append_pair("force_verify", "true");
            }
        }
        Ok(url.to_string())
    }

    /// Parses the token out of a redirect URL's fragment (`#access_token=...`).
    /// Browser-only in practice — the caller is responsible for capturing the
    /// fragment, which servers never see.
    pub fn parse_redirect_fragment(
        &self,
        fragment: &str,
        expected_state: &str,
        ignore_state_mismatch: bool,
    ) -> Result<Option<AccessToken>> {
        let pairs: std::collections::HashMap<String, String> =
            url::form_urlencoded::parse(fragment.as_bytes())
                .into_owned()
                .collect();

        let state = pairs
            .get("state")
            .ok_or_else(|| Error::Config("redirect fragment missing state".into()))?;
        if !super::csrf::verify_state(expected_state, state, ignore_state_mismatch)? {
            return Ok(None);
        }

        let access_token = pairs
            .get("access_token")
            .ok_or_else(|| Error::Config("redirect fragment missing access_token".into()))?
            .clone();
        let token_type = pairs
            .get("token_type")
            .map(String::as_str)
            .unwrap_or("bearer");
        if !token_type.eq_ignore_ascii_case("bearer") {
            return Err(Error::Protocol(format!("unexpected token_type: {token_type}")));
        }
        let expires_in: u64 = pairs
            .get("expires_in")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Config("redirect fragment missing expires_in".into()))?;
        let scopes = pairs
            .get("scope")
            .map(|s| s.split(' ').map(Scope::new).collect())
            .unwrap_or_default();

        Ok(Some(AccessToken::new_user(
            access_token,
            None,
            Duration::from_secs(expires_in),
            scopes,
        )))
    }
}

impl TokenFlow for ImplicitFlow {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Implicit tokens carry no refresh credential.
    fn can_refresh(&self, _token: &AccessToken) -> bool {
        false
    }
}

// --- Authorization-code flow -------------------------------------------------

pub struct AuthorizationCodeFlow {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl AuthorizationCodeFlow {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
        }
    }

    pub fn build_authorize_url(&self, scopes: &[&str], state: &str, force_verify: bool) -> Result<String> {
        let mut url = Url::parse(AUTHORIZE_ENDPOINT)?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scope", &scopes.join(" "))
                .append_pair("state", state);
            if force_verify {
                qp.append_pair("force_verify", "true");
            }
        }
        Ok(url.to_string())
    }

    /// Exchanges an authorization code for a token. Server-only: requires the
    /// client secret.
    pub async fn exchange_code(&self, http: &reqwest::Client, code: &str) -> Result<AccessToken> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];
        let resp: TokenResponse = http
            .post(TOKEN_ENDPOINT)
            .form(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let resp = require_bearer(resp)?;

        Ok(AccessToken::new_user(
            resp.access_token,
            resp.refresh_token,
            Duration::from_secs(resp.expires_in),
            parse_scopes(resp.scope),
        ))
    }

    /// Refresh using the stored refresh credential + client secret.
    pub async fn refresh(&self, http: &reqwest::Client, token: &AccessToken) -> Result<AccessToken> {
        let refresh_token = token
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::Config("no refresh_token on this token".into()))?;
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let resp: TokenResponse = http
            .post(TOKEN_ENDPOINT)
            .form(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let resp = require_bearer(resp)?;

        Ok(AccessToken::new_user(
            resp.access_token,
            resp.refresh_token.or_else(|| token.refresh_token.clone()),
            Duration::from_secs(resp.expires_in),
            parse_scopes(resp.scope),
        ))
    }
}

impl TokenFlow for AuthorizationCodeFlow {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn can_refresh(&self, token: &AccessToken) -> bool {
        token.refresh_token.is_some()
    }
}

// --- Device-code flow ---------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub expires_in: u64,
    pub interval: u64,
    pub user_code: String,
    pub verification_uri: String,
}

pub enum DevicePollOutcome {
    Token(AccessToken),
    AuthorizationPending,
    Expired,
}

#[derive(Debug, Deserialize)]
struct DeviceErrorResponse {
    message: String,
}

pub struct DeviceCodeFlow {
    pub client_id: String,
    /// Confidential clients provide a secret; public clients do not.
    pub client_secret: Option<String>,
}

impl DeviceCodeFlow {
    pub fn new(client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
        }
    }

    pub async fn request_device_code(
        &self,
        http: &reqwest::Client,
        scopes: &[&str],
    ) -> Result<DeviceCodeResponse> {
        let mut params = vec![("client_id", self.client_id.as_str()), ("scopes", "")];
        let scope_str = scopes.join(" ");
        params[1].1 = &scope_str;
        let resp = http
            .post(DEVICE_ENDPOINT)
            .form(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp)
    }

    /// Polls the token endpoint once. The caller is responsible for calling
    /// this no more than once concurrently per device code (single-flight)
    /// and for sleeping `interval` seconds between calls.
    pub async fn poll_once(&self, http: &reqwest::Client, device_code: &str) -> Result<DevicePollOutcome> {
        let mut params = vec![
            ("client_id", self.client_id.as_str()),
            ("device_code", device_code),
            (
                "grant_type",
                "urn:ietf:params:oauth:grant-type:device_code",
            ),
        ];
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        let resp = http.post(TOKEN_ENDPOINT).form(&params).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_success() {
            let token: TokenResponse = serde_json::from_str(&body)?;
            let token = require_bearer(token)?;
            return Ok(DevicePollOutcome::Token(AccessToken::new_user(
                token.access_token,
                token.refresh_token,
                Duration::from_secs(token.expires_in),
                parse_scopes(token.scope),
            )));
        }

        let err: DeviceErrorResponse = serde_json::from_str(&body)
            .unwrap_or_else(|_| DeviceErrorResponse { message: body.clone() });
        match err.message.as_str() {
            "authorization_pending" => Ok(DevicePollOutcome::AuthorizationPending),
            "expired_token" | "device_code_expired" => Ok(DevicePollOutcome::Expired),
            other => Err(Error::Protocol(format!("device poll failed: {other}"))),
        }
    }

    /// Single-flight poll loop: polls at the server-dictated interval until a
    /// token is obtained, the device code expires, or `cancel` fires.
    pub async fn poll_until_complete(
        &self,
        http: &reqwest::Client,
        device: &DeviceCodeResponse,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<AccessToken> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(device.expires_in);
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::InvalidToken);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(device.interval)) => {}
            }

            match self.poll_once(http, &device.device_code).await? {
                DevicePollOutcome::Token(t) => return Ok(t),
                DevicePollOutcome::AuthorizationPending => continue,
                DevicePollOutcome::Expired => return Err(Error::InvalidToken),
            }
        }
    }
}

impl DeviceCodeFlow {
    /// Refresh reuses the standard `refresh_token` grant; whether a secret
    /// is required depends on whether this is a confidential or public client.
    pub async fn refresh(&self, http: &reqwest::Client, token: &AccessToken) -> Result<AccessToken> {
        let refresh_token = token
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::Config("no refresh_token on this token".into()))?;
        let mut params = vec![
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.as_str()));
        }
        let resp: TokenResponse = http
            .post(TOKEN_ENDPOINT)
            .form(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let resp = require_bearer(resp)?;

        Ok(AccessToken::new_user(
            resp.access_token,
            resp.refresh_token.or_else(|| token.refresh_token.clone()),
            Duration::from_secs(resp.expires_in),
            parse_scopes(resp.scope),
        ))
    }
}

impl TokenFlow for DeviceCodeFlow {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn can_refresh(&self, token: &AccessToken) -> bool {
        token.refresh_token.is_some()
    }
}

// --- Client-credentials flow -------------------------------------------------

pub struct ClientCredentialsFlow {
    pub client_id: String,
    pub client_secret: String,
}

impl ClientCredentialsFlow {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Mints an app access token. Server-only: requires the client secret.
    pub async fn acquire(&self, http: &reqwest::Client) -> Result<AccessToken> {
        if self.client_secret.is_empty() {
            return Err(Error::Config(
                "client_credentials flow requires a client secret".into(),
            ));
        }
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];
        let resp: TokenResponse = http
            .post(TOKEN_ENDPOINT)
            .form(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let resp = require_bearer(resp)?;

        Ok(AccessToken::new_app(
            resp.access_token,
            Duration::from_secs(resp.expires_in),
        ))
    }
}

impl TokenFlow for ClientCredentialsFlow {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    /// App tokens have no refresh operation distinct from re-issuance.
    fn can_refresh(&self, _token: &AccessToken) -> bool {
        true
    }
}

/// Object-safe view of a flow's refresh contract, used by [`crate::oauth::provider::TokenProvider`]
/// so it can hold any one of the four flows behind a `dyn` pointer.
#[async_trait::async_trait]
pub trait Refreshable: Send + Sync {
    fn client_id(&self) -> &str;
    fn can_refresh(&self, token: &AccessToken) -> bool;
    async fn refresh(&self, http: &reqwest::Client, token: &AccessToken) -> Result<AccessToken>;
}

#[async_trait::async_trait]
impl Refreshable for ImplicitFlow {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn can_refresh(&self, _token: &AccessToken) -> bool {
        false
    }

    async fn refresh(&self, _http: &reqwest::Client, _token: &AccessToken) -> Result<AccessToken> {
        Err(Error::Config("implicit flow cannot refresh".into()))
    }
}

#[async_trait::async_trait]
impl Refreshable for AuthorizationCodeFlow {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn can_refresh(&self, token: &AccessToken) -> bool {
        TokenFlow::can_refresh(self, token)
    }

    async fn refresh(&self, http: &reqwest::Client, token: &AccessToken) -> Result<AccessToken> {
        AuthorizationCodeFlow::refresh(self, http, token).await
    }
}

#[async_trait::async_trait]
impl Refreshable for DeviceCodeFlow {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn can_refresh(&self, token: &AccessToken) -> bool {
        TokenFlow::can_refresh(self, token)
    }

    async fn refresh(&self, http: &reqwest::Client, token: &AccessToken) -> Result<AccessToken> {
        DeviceCodeFlow::refresh(self, http, token).await
    }
}

#[async_trait::async_trait]
impl Refreshable for ClientCredentialsFlow {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn can_refresh(&self, _token: &AccessToken) -> bool {
        true
    }

    /// "Refresh" for client-credentials is a fresh issuance.
    async fn refresh(&self, http: &reqwest::Client, _token: &AccessToken) -> Result<AccessToken> {
        self.acquire(http).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_flow_rejects_refresh() {
        let flow = ImplicitFlow::new("cid", "http://localhost/cb");
        let token = AccessToken::new_user("t".into(), None, Duration::from_secs(3600), HashSet::new());
        assert!(!flow.can_refresh(&token));
    }

    #[test]
    fn implicit_flow_builds_authorize_url() {
        let flow = ImplicitFlow::new("cid", "http://localhost/cb");
        let url = flow
            .build_authorize_url(&["user:read:chat"], "abc123", false)
            .unwrap();
        assert!(url.starts_with(AUTHORIZE_ENDPOINT));
        assert!(url.contains("response_type=token"));
        assert!(url.contains("state=abc123"));
    }

    #[test]
    fn implicit_flow_parses_redirect_fragment() {
        let flow = ImplicitFlow::new("cid", "http://localhost/cb");
        let fragment = "access_token=AT&token_type=bearer&expires_in=14400&scope=user%3Aread%3Achat&state=s1";
        let token = flow
            .parse_redirect_fragment(fragment, "s1", false)
            .unwrap()
            .unwrap();
        assert_eq!(token.access_token, "AT");
        assert!(token.scopes.contains(&Scope::new("user:read:chat")));
    }

    #[test]
    fn implicit_flow_state_mismatch_fails() {
        let flow = ImplicitFlow::new("cid", "http://localhost/cb");
        let fragment = "access_token=AT&token_type=bearer&expires_in=10&state=wrong";
        let err = flow
            .parse_redirect_fragment(fragment, "expected", false)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn client_credentials_requires_secret() {
        let flow = ClientCredentialsFlow::new("cid", "");
        assert!(flow.client_secret.is_empty());
    }

    #[test]
    fn auth_code_flow_can_refresh_iff_refresh_token_present() {
        let flow = AuthorizationCodeFlow::new("cid", "secret", "http://localhost/cb");
        let with = AccessToken::new_user(
            "t".into(),
            Some("r".into()),
            Duration::from_secs(3600),
            HashSet::new(),
        );
        let without = AccessToken::new_user("t".into(), None, Duration::from_secs(3600), HashSet::new());
        assert!(flow.can_refresh(&with));
        assert!(!flow.can_refresh(&without));
    }
}
