// =============================================================================
// Bearer Session Authentication — Axum extractor
// =============================================================================
//
// Token issuance (login, refresh, expiry) belongs to the external auth
// service; this extractor only resolves an opaque bearer token through the
// KV store (`session:{token}` -> user id) and rejects the request when no
// session exists.
//
// Usage:
//
//   async fn handler(AuthUser(user_id): AuthUser, ...) { ... }
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::AppState;
use crate::store::KvStore;

/// Extractor yielding the authenticated user's id.
pub struct AuthUser(pub String);

pub struct AuthRejection {
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": {
                "code": "unauthorized",
                "message": self.message,
            }
        });
        (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response()
    }
}

/// Resolve a bearer token to a user id via the session store.
pub async fn resolve_token(store: &dyn KvStore, token: &str) -> Option<String> {
    if token.is_empty() {
        return None;
    }
    store
        .get(&format!("session:{token}"))
        .await
        .ok()
        .flatten()
        .filter(|user_id| !user_id.is_empty())
}

#[async_trait::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection {
                    message: "Missing or invalid authorization token",
                });
            }
        };

        match resolve_token(state.store.as_ref(), token).await {
            Some(user_id) => Ok(AuthUser(user_id)),
            None => {
                warn!("unknown session token presented");
                Err(AuthRejection {
                    message: "Session expired or unknown",
                })
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    #[tokio::test]
    async fn resolve_known_token() {
        let store = MemoryKv::new();
        store.set("session:tok-1", "user-42").await.unwrap();
        assert_eq!(
            resolve_token(&store, "tok-1").await.as_deref(),
            Some("user-42")
        );
    }

    #[tokio::test]
    async fn unknown_or_empty_tokens_rejected() {
        let store = MemoryKv::new();
        assert!(resolve_token(&store, "nope").await.is_none());
        assert!(resolve_token(&store, "").await.is_none());
    }
}
