use std::collections::HashMap;

use bytes::Bytes;
use grelay_relay_core::RelayError;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

/// Who the caller is once its key has been accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub group: String,
    pub token_id: i64,
    pub token_name: String,
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl AuthError {
    fn unauthorized(code: &str, message: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        let body = RelayError::local(StatusCode::UNAUTHORIZED, code, message).to_json();
        Self {
            status: StatusCode::UNAUTHORIZED,
            headers,
            body,
        }
    }

    pub fn missing_key() -> Self {
        Self::unauthorized("missing_api_key", "no api key provided")
    }

    pub fn invalid_key() -> Self {
        Self::unauthorized("invalid_api_key", "api key is invalid")
    }
}

pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError>;
}

/// Static key table, loaded once from configuration.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuth {
    keys: HashMap<String, AuthContext>,
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>, ctx: AuthContext) -> Self {
        self.keys.insert(key.into(), ctx);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, ctx: AuthContext) {
        self.keys.insert(key.into(), ctx);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl AuthProvider for MemoryAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        let key = caller_key(headers).ok_or_else(AuthError::missing_key)?;
        self.keys.get(key).cloned().ok_or_else(AuthError::invalid_key)
    }
}

/// `Authorization: Bearer <key>`, falling back to `x-api-key`.
fn caller_key(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .map(str::trim);
    bearer
        .or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
        })
        .filter(|key| !key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> MemoryAuth {
        MemoryAuth::new().with_key(
            "sk-g1",
            AuthContext {
                group: "g1".to_string(),
                token_id: 7,
                token_name: "ci".to_string(),
            },
        )
    }

    #[test]
    fn bearer_and_api_key_headers_are_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-g1"));
        assert_eq!(auth().authenticate(&headers).unwrap().token_id, 7);

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-g1"));
        assert_eq!(auth().authenticate(&headers).unwrap().group, "g1");
    }

    #[test]
    fn missing_and_unknown_keys_are_rejected() {
        let err = auth().authenticate(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert!(String::from_utf8_lossy(&err.body).contains("missing_api_key"));

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-other"));
        let err = auth().authenticate(&headers).unwrap_err();
        assert!(String::from_utf8_lossy(&err.body).contains("invalid_api_key"));
        assert_eq!(err.headers[WWW_AUTHENTICATE], "Bearer");
    }
}
