//! Access token data model (spec.md §3).

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::scope::Scope;

/// Skew subtracted from a token's expiry when deciding usability, so a
/// token about to expire mid-request is refreshed proactively.
pub const EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    User,
    App,
}

/// A bearer credential with an absolute expiry and granted scopes.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub kind: TokenKind,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Instant,
    pub scopes: HashSet<Scope>,
    pub user_id: Option<String>,
    /// Whether the last validation call (if any) rejected this token.
    pub(crate) validation_failed: bool,
}

impl AccessToken {
    pub fn new_user(
        access_token: String,
        refresh_token: Option<String>,
        expires_in: Duration,
        scopes: HashSet<Scope>,
    ) -> Self {
        Self {
            kind: TokenKind::User,
            access_token,
            refresh_token,
            expires_at: Instant::now() + expires_in,
            scopes,
            user_id: None,
            validation_failed: false,
        }
    }

    pub fn new_app(access_token: String, expires_in: Duration) -> Self {
        Self {
            kind: TokenKind::App,
            access_token,
            refresh_token: None,
            expires_at: Instant::now() + expires_in,
            scopes: HashSet::new(),
            user_id: None,
            validation_failed: false,
        }
    }

    /// `now < expiry - skew` and (for user tokens) last validation didn't fail.
    pub fn is_usable(&self) -> bool {
        let not_expired = Instant::now() + EXPIRY_SKEW < self.expires_at;
        not_expired && !self.validation_failed
    }

    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_usable() {
        let t = AccessToken::new_app("abc".into(), Duration::from_secs(3600));
        assert!(t.is_usable());
    }

    #[test]
    fn near_expiry_token_is_not_usable() {
        let t = AccessToken::new_app("abc".into(), Duration::from_secs(10));
        assert!(!t.is_usable());
    }

    #[test]
    fn validation_failure_marks_unusable_even_if_unexpired() {
        let mut t = AccessToken::new_user("abc".into(), None, Duration::from_secs(3600), HashSet::new());
        assert!(t.is_usable());
        t.validation_failed = true;
        assert!(!t.is_usable());
    }
}
