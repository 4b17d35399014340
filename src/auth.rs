//! Request authentication
//!
//! Integrator routes call [`authorize`] at the top of the handler with the scope they
//! need. Internal routes sit behind [`require_internal_api_key`].

use crate::database::error::DatabaseError;
use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError};
use crate::middleware::error::get_request_id_from_headers;
use crate::payments::utils::secure_eq;
use crate::services::tenancy::Caller;
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

pub const API_KEY_HEADER: &str = "x-api-key";

/// What the OAuth provider knows about a live access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub client_id: String,
    pub scopes: Vec<String>,
}

impl TokenInfo {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Resolves bearer tokens issued by the OAuth provider. Unknown, expired and revoked
/// tokens all come back as `None`.
#[async_trait]
pub trait TokenIntrospector: Send + Sync {
    async fn introspect(&self, token: &str) -> Result<Option<TokenInfo>, DatabaseError>;
}

#[derive(Default)]
pub struct InMemoryTokenIntrospector {
    tokens: RwLock<HashMap<String, TokenInfo>>,
}

impl InMemoryTokenIntrospector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: &str, client_id: &str, scopes: &[&str]) {
        self.tokens.write().await.insert(
            token.to_string(),
            TokenInfo {
                client_id: client_id.to_string(),
                scopes: scopes.iter().map(|s| s.to_string()).collect(),
            },
        );
    }
}

#[async_trait]
impl TokenIntrospector for InMemoryTokenIntrospector {
    async fn introspect(&self, token: &str) -> Result<Option<TokenInfo>, DatabaseError> {
        Ok(self.tokens.read().await.get(token).cloned())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Insufficient scope: requires {scope}")]
    InsufficientScope { scope: String },

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("INTERNAL_API_KEY is not set")]
    ApiKeyNotConfigured,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        let reason = err.to_string();
        match err {
            AuthError::MissingToken | AuthError::InvalidToken | AuthError::MissingApiKey => {
                AppError::new(AppErrorKind::Domain(DomainError::Unauthenticated { reason }))
            }
            AuthError::InsufficientScope { .. } | AuthError::InvalidApiKey => {
                AppError::new(AppErrorKind::Domain(DomainError::Forbidden { reason }))
            }
            AuthError::ApiKeyNotConfigured => AppError::new(AppErrorKind::Infrastructure(
                InfrastructureError::Configuration { message: reason },
            )),
            AuthError::Database(db) => db.into(),
        }
    }
}

/// A request that passed the guard
#[derive(Debug, Clone)]
pub struct Authorized {
    pub caller: Caller,
    pub scopes: Vec<String>,
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn api_key_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Check a bearer token and the scope the handler needs
pub async fn authorize(
    headers: &HeaderMap,
    introspector: &dyn TokenIntrospector,
    scope: &str,
) -> Result<Authorized, AuthError> {
    let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
    let info = introspector
        .introspect(token)
        .await?
        .ok_or(AuthError::InvalidToken)?;

    if !info.has_scope(scope) {
        warn!(client_id = %info.client_id, scope, "token lacks required scope");
        return Err(AuthError::InsufficientScope {
            scope: scope.to_string(),
        });
    }

    Ok(Authorized {
        caller: Caller::OAuthClient {
            client_id: info.client_id,
        },
        scopes: info.scopes,
    })
}

/// `X-API-Key` first, then `Authorization: Bearer`
pub fn check_internal_key(headers: &HeaderMap, expected: Option<&str>) -> Result<(), AuthError> {
    let expected = expected
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(AuthError::ApiKeyNotConfigured)?;

    let provided = api_key_header(headers)
        .or_else(|| bearer_token(headers))
        .ok_or(AuthError::MissingApiKey)?;

    if secure_eq(provided.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(AuthError::InvalidApiKey)
    }
}

/// Either a valid bearer token (any scope) or the internal API key
pub async fn authorize_any(
    headers: &HeaderMap,
    introspector: &dyn TokenIntrospector,
    internal_key: Option<&str>,
) -> Result<Authorized, AuthError> {
    if check_internal_key(headers, internal_key).is_ok() {
        return Ok(Authorized {
            caller: Caller::Internal,
            scopes: Vec::new(),
        });
    }

    let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
    let info = introspector
        .introspect(token)
        .await?
        .ok_or(AuthError::InvalidToken)?;

    Ok(Authorized {
        caller: Caller::OAuthClient {
            client_id: info.client_id,
        },
        scopes: info.scopes,
    })
}

/// Guard for internal routes
pub async fn require_internal_api_key(
    State(expected): State<Option<Arc<str>>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Err(err) = check_internal_key(request.headers(), expected.as_deref()) {
        let mut error = AppError::from(err);
        if let Some(request_id) = get_request_id_from_headers(request.headers()) {
            error = error.with_request_id(request_id);
        }
        return error.into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn bearer_token_parsing() {
        assert_eq!(
            bearer_token(&headers(&[("authorization", "Bearer abc")])),
            Some("abc")
        );
        assert_eq!(
            bearer_token(&headers(&[("authorization", "bearer  abc ")])),
            Some("abc")
        );
        assert_eq!(bearer_token(&headers(&[("authorization", "Basic abc")])), None);
        assert_eq!(bearer_token(&headers(&[("authorization", "Bearer ")])), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn authorize_checks_token_and_scope() {
        let introspector = InMemoryTokenIntrospector::new();
        introspector.insert("tok", "client-a", &["c2b:write"]).await;

        let ok = authorize(
            &headers(&[("authorization", "Bearer tok")]),
            &introspector,
            "c2b:write",
        )
        .await
        .unwrap();
        assert_eq!(ok.caller.client_id(), Some("client-a"));

        let err = authorize(
            &headers(&[("authorization", "Bearer tok")]),
            &introspector,
            "b2c:write",
        )
        .await
        .unwrap_err();
        assert_eq!(AppError::from(err).status_code(), 403);

        let err = authorize(
            &headers(&[("authorization", "Bearer other")]),
            &introspector,
            "c2b:write",
        )
        .await
        .unwrap_err();
        assert_eq!(AppError::from(err).status_code(), 401);

        let err = authorize(&HeaderMap::new(), &introspector, "c2b:write")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MissingToken));
    }

    #[test]
    fn internal_key_statuses() {
        let status = |h: &HeaderMap, key: Option<&str>| {
            check_internal_key(h, key).map_err(|e| AppError::from(e).status_code())
        };

        assert_eq!(status(&headers(&[("x-api-key", "k1")]), Some("k1")), Ok(()));
        assert_eq!(
            status(&headers(&[("authorization", "Bearer k1")]), Some("k1")),
            Ok(())
        );
        assert_eq!(status(&HeaderMap::new(), Some("k1")), Err(401));
        assert_eq!(status(&headers(&[("x-api-key", "nope")]), Some("k1")), Err(403));
        assert_eq!(status(&headers(&[("x-api-key", "k1")]), None), Err(500));
        assert_eq!(status(&headers(&[("x-api-key", "k1")]), Some("  ")), Err(500));
    }

    #[tokio::test]
    async fn authorize_any_accepts_key_or_token() {
        let introspector = InMemoryTokenIntrospector::new();
        introspector.insert("tok", "client-a", &[]).await;

        let internal = authorize_any(&headers(&[("x-api-key", "k1")]), &introspector, Some("k1"))
            .await
            .unwrap();
        assert_eq!(internal.caller, Caller::Internal);

        let client = authorize_any(
            &headers(&[("authorization", "Bearer tok")]),
            &introspector,
            Some("k1"),
        )
        .await
        .unwrap();
        assert_eq!(client.caller.client_id(), Some("client-a"));

        assert!(authorize_any(&HeaderMap::new(), &introspector, Some("k1"))
            .await
            .is_err());
    }
}
