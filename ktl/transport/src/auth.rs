//! Shared auth middleware for both transports (`spec.md` §4.5): a
//! constant-time comparison against a configured shared secret, presented
//! as an `Authorization: Bearer` header, a custom header, or an HTTP-only
//! cookie that is itself issued/revoked through its own endpoint.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use dashmap::DashSet;
use subtle::ConstantTimeEq;

pub const CUSTOM_HEADER: &str = "x-ktl-token";
pub const COOKIE_NAME: &str = "ktl_session";

#[derive(Clone)]
pub struct AuthConfig {
    shared_secret: Arc<String>,
    cookie_name: String,
}

impl AuthConfig {
    pub fn new(shared_secret: impl Into<String>) -> Self {
        Self {
            shared_secret: Arc::new(shared_secret.into()),
            cookie_name: COOKIE_NAME.to_string(),
        }
    }
}

/// Tracks cookie tokens issued via `POST /api/v1/mirror/auth/cookie`, so
/// `DELETE` on the same endpoint can revoke one without rotating the whole
/// shared secret.
#[derive(Clone, Default)]
pub struct TokenStore(Arc<DashSet<String>>);

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.0.insert(token.clone());
        token
    }

    pub fn revoke(&self, token: &str) {
        self.0.remove(token);
    }

    fn contains(&self, token: &str) -> bool {
        self.0.contains(token)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn extract_bearer(value: &str) -> Option<&str> {
    value.strip_prefix("Bearer ").map(str::trim)
}

fn extract_cookie<'a>(header_value: &'a str, cookie_name: &str) -> Option<&'a str> {
    header_value.split(';').find_map(|pair| {
        let pair = pair.trim();
        let (name, value) = pair.split_once('=')?;
        (name == cookie_name).then_some(value)
    })
}

fn present_credential<'a>(
    request: &'a Request<axum::body::Body>,
    cookie_name: &str,
) -> Option<&'a str> {
    if let Some(auth) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = extract_bearer(auth) {
            return Some(token);
        }
    }
    if let Some(custom) = request
        .headers()
        .get(CUSTOM_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return Some(custom.trim());
    }
    if let Some(cookie) = request
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
    {
        return extract_cookie(cookie, cookie_name);
    }
    None
}

/// `axum::middleware::from_fn_with_state` entry point — rejects with `401`
/// unless the request carries a credential that matches the shared secret
/// or a currently-issued cookie token.
pub async fn require_token(
    State((auth, tokens)): State<(AuthConfig, TokenStore)>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let credential = present_credential(&request, &auth.cookie_name);
    let authorized = match credential {
        Some(token) => {
            constant_time_eq(token, &auth.shared_secret) || tokens.contains(token)
        }
        None => false,
    };

    if authorized {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_header_parses_token() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("Basic abc123"), None);
    }

    #[test]
    fn cookie_header_finds_named_cookie() {
        let header = "other=1; ktl_session=tok-1; another=2";
        assert_eq!(extract_cookie(header, "ktl_session"), Some("tok-1"));
        assert_eq!(extract_cookie(header, "missing"), None);
    }

    #[test]
    fn token_store_revoke_removes_issued_token() {
        let store = TokenStore::new();
        let token = store.issue();
        assert!(store.contains(&token));
        store.revoke(&token);
        assert!(!store.contains(&token));
    }
}
