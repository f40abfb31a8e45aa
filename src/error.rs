use std::fmt;

/// Error taxonomy shared by every fallible operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("endpoint does not support this token kind")]
    AuthUnsupported,

    #[error("token scopes do not satisfy required expression: {0:?}")]
    ScopeMissing(crate::scope::ScopeRequirement),

    #[error("token is invalid or could not be refreshed")]
    InvalidToken,

    #[error("response failed schema validation: {0}")]
    Protocol(String),

    #[error("request body failed schema validation: {0}")]
    BadRequest(String),

    #[error("unknown (type, version): {0}/{1}")]
    UnknownKind(String, String),

    #[error("subscription revoked: {0}")]
    Revoked(RevocationReason),

    #[error("rate limited; retry after automatic backoff failed")]
    RateLimited,

    #[error("helix error {status}: {message}")]
    Helix { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// `subscription.status` values the server uses to explain a revocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    UserRemoved,
    AuthorizationRevoked,
    VersionRemoved,
    Other,
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RevocationReason::UserRemoved => "user_removed",
            RevocationReason::AuthorizationRevoked => "authorization_revoked",
            RevocationReason::VersionRemoved => "version_removed",
            RevocationReason::Other => "other",
        };
        f.write_str(s)
    }
}

impl RevocationReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "user_removed" => RevocationReason::UserRemoved,
            "authorization_revoked" => RevocationReason::AuthorizationRevoked,
            "version_removed" => RevocationReason::VersionRemoved,
            _ => RevocationReason::Other,
        }
    }
}
