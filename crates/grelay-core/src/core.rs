use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use grelay_dispatch::Relay;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::auth::AuthProvider;
use crate::handler::relay_handler;

pub const RELAY_PATHS: [&str; 13] = [
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/v1/engines/{model}/embeddings",
    "/v1/moderations",
    "/v1/images/generations",
    "/v1/images/edits",
    "/v1/edits",
    "/v1/audio/speech",
    "/v1/audio/transcriptions",
    "/v1/audio/translations",
    "/v1/rerank",
    "/v1/parse/pdf",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Largest accepted request body, audio and pdf uploads included.
    pub body_limit: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            body_limit: 32 * 1024 * 1024,
        }
    }
}

pub struct CoreState {
    pub relay: Arc<Relay>,
    pub auth: Arc<dyn AuthProvider>,
    pub config: CoreConfig,
    /// Relays still running, including those whose caller already left.
    pub relays: TaskTracker,
}

pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(relay: Arc<Relay>, auth: Arc<dyn AuthProvider>, config: CoreConfig) -> Self {
        Self {
            state: Arc::new(CoreState {
                relay,
                auth,
                config,
                relays: TaskTracker::new(),
            }),
        }
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new();
        for path in RELAY_PATHS {
            router = router.route(path, post(relay_handler));
        }
        router
            .layer(DefaultBodyLimit::max(self.state.config.body_limit))
            .with_state(self.state.clone())
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }

    pub fn pending_relays(&self) -> usize {
        self.state.relays.len()
    }

    /// Stops tracking new relays and waits for running ones, so their
    /// billing is spawned before the billing tasks drain. Returns false when
    /// `limit` passes first.
    pub async fn drain_relays(&self, limit: Duration) -> bool {
        let relays = &self.state.relays;
        relays.close();
        if !relays.is_empty() {
            info!(event = "relay_drain", pending = relays.len());
        }
        match tokio::time::timeout(limit, relays.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(event = "relay_drain_timeout", pending = relays.len());
                false
            }
        }
    }
}
