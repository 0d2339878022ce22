//! Token authentication.
//!
//! The token comes from the connection handshake. A valid token sets the
//! acting client id; a missing one falls back to the connection's own id
//! unless authentication is required.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::net::ConnectionInfo;
use crate::pipeline::{keys, IncomingRequest, Middleware};
use crate::protocol::ErrorCode;

/// Resolves bearer tokens to client ids.
pub trait TokenStore: Send + Sync {
    fn client_for(&self, token: &str) -> Option<String>;
}

/// Token store backed by configuration.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: ArcSwap<HashMap<String, String>>,
}

impl InMemoryTokenStore {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self {
            tokens: ArcSwap::from_pointee(tokens),
        }
    }

    pub fn replace(&self, tokens: HashMap<String, String>) {
        self.tokens.store(Arc::new(tokens));
    }
}

impl TokenStore for InMemoryTokenStore {
    fn client_for(&self, token: &str) -> Option<String> {
        self.tokens.load().get(token).cloned()
    }
}

pub struct Authenticate {
    store: Arc<dyn TokenStore>,
    required: AtomicBool,
}

impl Authenticate {
    pub fn new(store: Arc<dyn TokenStore>, required: bool) -> Self {
        Self {
            store,
            required: AtomicBool::new(required),
        }
    }

    pub fn set_required(&self, required: bool) {
        self.required.store(required, Ordering::Relaxed);
    }
}

impl Middleware for Authenticate {
    fn handle(&self, connection: &ConnectionInfo, mut request: IncomingRequest) -> IncomingRequest {
        match connection.credentials.as_deref() {
            Some(token) => match self.store.client_for(token) {
                Some(client_id) => {
                    let ctx = request.context_mut();
                    ctx.insert(keys::CLIENT_ID, client_id);
                    ctx.insert(keys::AUTHENTICATED, true);
                }
                None => {
                    tracing::warn!(
                        connection_id = %connection.id,
                        client_id = %connection.client_id,
                        "Rejected unknown token"
                    );
                    request.reject(ErrorCode::Unauthorized, "invalid token");
                }
            },
            None if self.required.load(Ordering::Relaxed) => {
                request.reject(ErrorCode::Unauthorized, "authentication required");
            }
            None => {
                let ctx = request.context_mut();
                ctx.insert(keys::CLIENT_ID, connection.client_id.clone());
                ctx.insert(keys::AUTHENTICATED, false);
            }
        }
        request
    }
}
