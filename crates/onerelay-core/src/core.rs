use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::auth::AuthProvider;
use crate::handler::{balance_handler, chat_completions_handler, completions_handler, images_handler};
use crate::relay::RelayEngine;

pub struct CoreState {
    pub engine: Arc<RelayEngine>,
    pub auth: Arc<dyn AuthProvider>,
    /// blake3 hex of the admin key. `None` disables the admin routes.
    pub admin_key_hash: Option<String>,
}

pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(
        engine: Arc<RelayEngine>,
        auth: Arc<dyn AuthProvider>,
        admin_key_hash: Option<String>,
    ) -> Self {
        Self {
            state: Arc::new(CoreState {
                engine,
                auth,
                admin_key_hash,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/completions", post(completions_handler))
            .route("/v1/chat/completions", post(chat_completions_handler))
            .route("/v1/images/generations", post(images_handler))
            .route("/api/channel/{id}/balance", get(balance_handler))
            .with_state(self.state.clone())
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }
}

pub fn hash_admin_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}
