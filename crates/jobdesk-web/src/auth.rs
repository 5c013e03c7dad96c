//! Bearer-token authorization capability: request token to [`Actor`].

use std::collections::HashMap;

use axum::http::{header, HeaderMap};
use jobdesk_core::{Actor, Role};
use thiserror::Error;

pub trait Authorizer: Send + Sync {
    fn actor_for_token(&self, token: &str) -> Option<Actor>;
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed token entry {entry:?}: {reason}")]
pub struct TokenConfigError {
    pub entry: String,
    pub reason: &'static str,
}

/// Fixed token table, configured as `token:actor_id:role` entries separated by commas.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthorizer {
    tokens: HashMap<String, Actor>,
}

impl StaticTokenAuthorizer {
    pub fn parse(entries: &str) -> Result<Self, TokenConfigError> {
        let mut tokens = HashMap::new();
        for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let malformed = |reason| TokenConfigError {
                entry: entry.to_string(),
                reason,
            };
            let mut parts = entry.splitn(3, ':').map(str::trim);
            let (Some(token), Some(actor), Some(role)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(malformed("expected token:actor_id:role"));
            };
            if token.is_empty() || actor.is_empty() {
                return Err(malformed("token and actor id must be non-empty"));
            }
            let role = role
                .parse::<Role>()
                .map_err(|_| malformed("role must be admin or viewer"))?;
            tokens.insert(token.to_string(), Actor::new(actor, role));
        }
        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authorizer for StaticTokenAuthorizer {
    fn actor_for_token(&self, token: &str) -> Option<Actor> {
        self.tokens.get(token).cloned()
    }
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}
