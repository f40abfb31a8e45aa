//! Scope vocabulary and the recursive requirement predicate (C3).

use std::collections::HashSet;

/// A single Twitch OAuth scope string, e.g. `user:read:chat`.
///
/// Twitch's vocabulary is ~120 strings and grows over releases, so this
/// wraps an owned `String` rather than a closed enum: unknown scopes in a
/// validation response are preserved (spec.md §6), not rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope(String);

impl Scope {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Scope {
    fn from(s: &str) -> Self {
        Scope::new(s)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A handful of the ~120 well-known Twitch scopes, used by the catalog
/// entries in [`crate::catalog`]. Callers are not restricted to these —
/// [`Scope::new`] accepts any string — this is a convenience, not a closed
/// enumeration.
pub mod well_known {
    pub const USER_READ_CHAT: &str = "user:read:chat";
    pub const USER_BOT: &str = "user:bot";
    pub const CHANNEL_BOT: &str = "channel:bot";
    pub const CHANNEL_READ_SUBSCRIPTIONS: &str = "channel:read:subscriptions";
    pub const CHANNEL_READ_REDEMPTIONS: &str = "channel:read:redemptions";
    pub const MODERATOR_READ_FOLLOWERS: &str = "moderator:read:followers";
    pub const CHANNEL_MANAGE_REDEMPTIONS: &str = "channel:manage:redemptions";
}

/// A recursive expression describing what scopes a token must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeRequirement {
    /// Vacuously satisfied by any granted set.
    None,
    Single(Scope),
    AllOf(Vec<ScopeRequirement>),
    AnyOf(Vec<ScopeRequirement>),
}

impl ScopeRequirement {
    pub fn single(s: impl Into<String>) -> Self {
        ScopeRequirement::Single(Scope::new(s))
    }

    pub fn all_of(reqs: impl IntoIterator<Item = ScopeRequirement>) -> Self {
        ScopeRequirement::AllOf(reqs.into_iter().collect())
    }

    pub fn any_of(reqs: impl IntoIterator<Item = ScopeRequirement>) -> Self {
        ScopeRequirement::AnyOf(reqs.into_iter().collect())
    }

    /// Evaluates this requirement against a granted set. Pure, no I/O.
    pub fn satisfies(&self, granted: &HashSet<Scope>) -> bool {
        match self {
            ScopeRequirement::None => true,
            ScopeRequirement::Single(s) => granted.contains(s),
            ScopeRequirement::AllOf(children) => children.iter().all(|c| c.satisfies(granted)),
            ScopeRequirement::AnyOf(children) => children.iter().any(|c| c.satisfies(granted)),
        }
    }
}
