use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

pub const DEFAULT_REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    #[error("invalid credential: {0}")]
    Invalid(String),
    #[error("token exchange failed: {0}")]
    Exchange(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangedToken {
    pub access_token: String,
    pub expires_at: OffsetDateTime,
}

impl ExchangedToken {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

/// Trades a long-lived credential for a short-lived bearer token.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, credential: &str) -> Result<ExchangedToken, CredentialError>;
}

#[derive(Debug, Default)]
struct Inner {
    tokens: DashMap<String, ExchangedToken>,
    refreshing: DashSet<String>,
}

/// Exchanged tokens keyed by credential. Cloning shares the cache.
#[derive(Debug, Clone)]
pub struct CredentialCache {
    inner: Arc<Inner>,
    refresh_window: Duration,
}

impl Default for CredentialCache {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_WINDOW)
    }
}

impl CredentialCache {
    pub fn new(refresh_window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            refresh_window,
        }
    }

    /// A token close to expiry is still served while one background refresh
    /// replaces it. Missing or expired tokens are exchanged inline.
    pub async fn get_or_exchange(
        &self,
        credential: &str,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> Result<String, CredentialError> {
        let now = OffsetDateTime::now_utc();
        let cached = self.inner.tokens.get(credential).map(|entry| entry.clone());
        if let Some(token) = cached.filter(|token| !token.is_expired(now)) {
            if token.expires_at <= now + self.refresh_window {
                self.spawn_refresh(credential, exchanger);
            }
            return Ok(token.access_token);
        }

        let token = exchanger.exchange(credential).await?;
        let access_token = token.access_token.clone();
        self.inner.tokens.insert(credential.to_string(), token);
        Ok(access_token)
    }

    pub fn invalidate(&self, credential: &str) {
        self.inner.tokens.remove(credential);
    }

    pub fn len(&self) -> usize {
        self.inner.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tokens.is_empty()
    }

    fn spawn_refresh(&self, credential: &str, exchanger: Arc<dyn TokenExchanger>) {
        if !self.inner.refreshing.insert(credential.to_string()) {
            return;
        }
        let inner = self.inner.clone();
        let credential = credential.to_string();
        tokio::spawn(async move {
            match exchanger.exchange(&credential).await {
                Ok(token) => {
                    debug!(event = "credential_refreshed", expires_at = %token.expires_at);
                    inner.tokens.insert(credential.clone(), token);
                }
                Err(err) => {
                    warn!(event = "credential_refresh_failed", error = %err);
                }
            }
            inner.refreshing.remove(&credential);
        });
    }
}
