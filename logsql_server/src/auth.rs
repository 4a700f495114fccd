//! Token checks against the grants of the current config.

use chrono::{DateTime, Utc};
use hyper::{HeaderMap, StatusCode};
use logsql_config::{Config, Scope};
use thiserror::Error;

/// Request header carrying the access token (`MINSQL-TOKEN`). Header names
/// are matched case insensitively; the constant is lowercase as `http`
/// requires for static names.
pub const TOKEN_HEADER: &str = "minsql-token";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing {} header", TOKEN_HEADER)]
    MissingToken,

    /// Unknown, expired or disabled.
    #[error("invalid token")]
    InvalidToken,

    #[error("token has no {scope} access to table '{table}'")]
    Forbidden { scope: Scope, table: String },
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
        }
    }
}

pub fn token_from_headers(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)
}

/// Check that `token` holds at least one grant that is still active.
pub fn authenticate(config: &Config, token: &str, now: DateTime<Utc>) -> Result<(), AuthError> {
    config
        .auth
        .get(token)
        .is_some_and(|grants| grants.values().any(|g| g.is_active_at(now)))
        .then_some(())
        .ok_or(AuthError::InvalidToken)
}

/// Check that `token` may use `scope` on `table`.
pub fn authorize(
    config: &Config,
    token: &str,
    table: &str,
    scope: Scope,
    now: DateTime<Utc>,
) -> Result<(), AuthError> {
    if !config.knows_token(token) {
        return Err(AuthError::InvalidToken);
    }
    let forbidden = || AuthError::Forbidden {
        scope,
        table: table.to_string(),
    };
    let grant = config.grant(token, table).ok_or_else(forbidden)?;
    if !grant.is_active_at(now) {
        return Err(AuthError::InvalidToken);
    }
    if !grant.allows(scope) {
        return Err(forbidden());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hyper::header::HeaderValue;
    use logsql_config::AuthGrant;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn config() -> Config {
        let now = Utc::now();
        let mut grants = BTreeMap::new();
        grants.insert("weblog".to_string(), AuthGrant::new("tok", [Scope::Search]));
        grants.insert("api".to_string(), AuthGrant::new("tok", [Scope::Admin]));
        grants.insert(
            "old".to_string(),
            AuthGrant {
                expiry: Some(now - Duration::hours(1)),
                ..AuthGrant::new("tok", [Scope::Search])
            },
        );
        let mut disabled = BTreeMap::new();
        disabled.insert(
            "weblog".to_string(),
            AuthGrant {
                enabled: false,
                ..AuthGrant::new("off", [Scope::Search])
            },
        );

        let mut config = Config::default();
        config.auth.insert("tok".to_string(), grants);
        config.auth.insert("off".to_string(), disabled);
        config
    }

    #[test]
    fn header() {
        let mut headers = HeaderMap::new();
        assert_eq!(token_from_headers(&headers), Err(AuthError::MissingToken));
        headers.insert(TOKEN_HEADER, HeaderValue::from_static("  "));
        assert_eq!(token_from_headers(&headers), Err(AuthError::MissingToken));
        headers.insert(TOKEN_HEADER, HeaderValue::from_static("tok"));
        assert_eq!(token_from_headers(&headers), Ok("tok"));
    }

    #[test]
    fn scopes() {
        let config = config();
        let now = Utc::now();
        assert_eq!(authorize(&config, "tok", "weblog", Scope::Search, now), Ok(()));
        assert_eq!(
            authorize(&config, "tok", "weblog", Scope::Store, now),
            Err(AuthError::Forbidden {
                scope: Scope::Store,
                table: "weblog".to_string()
            })
        );
        assert_eq!(authorize(&config, "tok", "api", Scope::Store, now), Ok(()));
        assert!(matches!(
            authorize(&config, "tok", "other", Scope::Search, now),
            Err(AuthError::Forbidden { .. })
        ));
    }

    #[test]
    fn inactive_grants() {
        let config = config();
        let now = Utc::now();
        assert_eq!(
            authorize(&config, "tok", "old", Scope::Search, now),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            authorize(&config, "off", "weblog", Scope::Search, now),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            authorize(&config, "nope", "weblog", Scope::Search, now),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(AuthError::InvalidToken.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn authentication() {
        let config = config();
        let now = Utc::now();
        assert_eq!(authenticate(&config, "tok", now), Ok(()));
        assert_eq!(authenticate(&config, "off", now), Err(AuthError::InvalidToken));
        assert_eq!(authenticate(&config, "nope", now), Err(AuthError::InvalidToken));
    }
}
