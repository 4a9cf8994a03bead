//! Identity checks for HTTP and WebSocket routes.
//!
//! Token issuance lives elsewhere; this server only asks an injected
//! predicate whether a presented token is acceptable.

use axum::{
    Json,
    body::Body,
    extract::{Query, Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::collections::HashSet;

use crate::AppState;

/// Decides whether a presented identity token is acceptable.
pub trait IdentityValidator: Send + Sync {
    fn is_valid(&self, token: &str) -> bool;
}

/// Accepts exactly the configured tokens.
pub struct TokenListValidator {
    tokens: HashSet<String>,
}

impl TokenListValidator {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl IdentityValidator for TokenListValidator {
    fn is_valid(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }
}

/// Open mode, used when auth is disabled: any presented token is accepted,
/// but a client must still present one.
pub struct AllowAll;

impl IdentityValidator for AllowAll {
    fn is_valid(&self, _token: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("identity token required")]
    MissingToken,
    #[error("identity token rejected")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Check an optional token against the validator. An absent or blank token
/// never reaches the validator.
pub fn check_identity(
    validator: &dyn IdentityValidator,
    token: Option<&str>,
) -> Result<(), AuthError> {
    match token.map(str::trim).filter(|t| !t.is_empty()) {
        Some(token) if validator.is_valid(token) => Ok(()),
        Some(_) => Err(AuthError::InvalidToken),
        None => Err(AuthError::MissingToken),
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer header first, then `?token=` (browsers cannot set headers on WebSocket upgrades).
fn request_token(request: &Request<Body>) -> Option<String> {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    bearer.or_else(|| {
        Query::<TokenQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(q)| q.token)
    })
}

/// Auth middleware for `/api/*` routes.
pub async fn require_identity(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let token = request_token(&request);
    if let Err(e) = check_identity(state.validator.as_ref(), token.as_deref()) {
        tracing::debug!(path = %request.uri().path(), error = %e, "Rejected API request");
        return Err(e);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenListValidator {
        TokenListValidator::new(["good".to_string()])
    }

    #[test]
    fn token_list_accepts_known_token() {
        assert_eq!(check_identity(&validator(), Some("good")), Ok(()));
    }

    #[test]
    fn token_list_rejects_unknown_and_missing() {
        assert_eq!(
            check_identity(&validator(), Some("bad")),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            check_identity(&validator(), None),
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            check_identity(&validator(), Some("  ")),
            Err(AuthError::MissingToken)
        );
    }

    #[test]
    fn open_mode_still_requires_a_token() {
        assert_eq!(check_identity(&AllowAll, None), Err(AuthError::MissingToken));
        assert_eq!(
            check_identity(&AllowAll, Some("")),
            Err(AuthError::MissingToken)
        );
        assert_eq!(check_identity(&AllowAll, Some("anything")), Ok(()));
    }

    #[test]
    fn token_from_header_or_query() {
        let req = axum::http::Request::builder()
            .uri("/api/sessions")
            .header(header::AUTHORIZATION, "Bearer abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_token(&req).as_deref(), Some("abc"));

        let req = axum::http::Request::builder()
            .uri("/api/events?token=xyz")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_token(&req).as_deref(), Some("xyz"));

        let req = axum::http::Request::builder()
            .uri("/api/sessions")
            .body(Body::empty())
            .unwrap();
        assert!(request_token(&req).is_none());
    }
}
