//! API key authentication.
//!
//! The key is accepted from `X-API-Key` or `Authorization: Bearer <key>`.
//! Keys are compared through an HMAC tag so the check runs in constant time.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::api::error::ApiError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared-secret authenticator. Without a secret every request is allowed.
#[derive(Clone, Default)]
pub struct ApiKeyAuth {
    secret: Option<Arc<Secret>>,
}

struct Secret {
    key: Vec<u8>,
    tag: Vec<u8>,
}

impl ApiKeyAuth {
    pub fn new(secret: Option<&str>) -> Self {
        let secret = secret.filter(|s| !s.is_empty()).and_then(|s| {
            let tag = tag_for(s.as_bytes(), s.as_bytes())?;
            Some(Arc::new(Secret {
                key: s.as_bytes().to_vec(),
                tag,
            }))
        });
        Self { secret }
    }

    pub fn disabled() -> Self {
        Self { secret: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Check if an API key is valid.
    pub fn is_valid(&self, key: &str) -> bool {
        let Some(secret) = &self.secret else {
            return true;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&secret.key) else {
            return false;
        };
        mac.update(key.as_bytes());
        mac.verify_slice(&secret.tag).is_ok()
    }
}

impl std::fmt::Debug for ApiKeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyAuth")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

fn tag_for(key: &[u8], message: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(message);
    Some(mac.finalize().into_bytes().to_vec())
}

/// Extract the presented key from the request headers.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Middleware function for API key authentication.
pub async fn api_key_auth(State(auth): State<ApiKeyAuth>, request: Request, next: Next) -> Response {
    if !auth.is_enabled() {
        return next.run(request).await;
    }

    match presented_key(request.headers()) {
        Some(key) if auth.is_valid(key) => next.run(request).await,
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "Invalid API key provided");
            ApiError::unauthorized("Invalid API key").into_response()
        }
        None => {
            tracing::warn!(path = %request.uri().path(), "Missing API key in request");
            ApiError::unauthorized("Missing API key").into_response()
        }
    }
}
