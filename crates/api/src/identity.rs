//! Static bearer-token identity provider.

use std::collections::HashMap;

use dashlite_core::Identity;
use tracing::debug;

use crate::{DashError, DashResult};

/// Maps bearer tokens to identities; requests without a token fall back to
/// the anonymous identity when one is configured.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    tokens: HashMap<String, Identity>,
    anonymous: Option<Identity>,
}

impl IdentityResolver {
    pub fn new(tokens: impl IntoIterator<Item = (String, Identity)>, anonymous: Option<Identity>) -> Self {
        Self { tokens: tokens.into_iter().collect(), anonymous }
    }

    pub fn anonymous_enabled(&self) -> bool {
        self.anonymous.is_some()
    }

    /// An unknown token is rejected even when anonymous access is on.
    pub fn resolve(&self, token: Option<&str>) -> DashResult<Identity> {
        match token {
            Some(t) => self.tokens.get(t).cloned().ok_or_else(|| {
                debug!("auth: unknown bearer token");
                DashError::Unauthorized("invalid token".into())
            }),
            None => self
                .anonymous
                .clone()
                .ok_or_else(|| DashError::Unauthorized("authentication required".into())),
        }
    }
}

/// Token part of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(anonymous: bool) -> IdentityResolver {
        IdentityResolver::new(
            [("s3cret".to_string(), Identity::new("alice", ["staging"]))],
            anonymous.then(|| Identity::new("anonymous", ["viewer"])),
        )
    }

    #[test]
    fn known_token_resolves() {
        let who = resolver(false).resolve(Some("s3cret")).unwrap();
        assert_eq!(who.username, "alice");
        assert_eq!(who.roles, vec!["staging"]);
    }

    #[test]
    fn unknown_token_is_rejected_even_with_anonymous() {
        assert!(matches!(resolver(true).resolve(Some("nope")), Err(DashError::Unauthorized(_))));
    }

    #[test]
    fn missing_token_depends_on_anonymous_access() {
        assert!(matches!(resolver(false).resolve(None), Err(DashError::Unauthorized(_))));
        assert_eq!(resolver(true).resolve(None).unwrap().roles, vec!["viewer"]);
    }

    #[test]
    fn parses_bearer_header() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer   abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Bearer"), None);
    }
}
