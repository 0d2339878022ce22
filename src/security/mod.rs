//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request (pipeline, ascending priority):
//!     → classify.rs   (10) mark the connection internal or external
//!     → auth.rs       (20) resolve the acting client id from the token
//!     → rate_limit.rs (30) per-IP token bucket
//!     → block_list.rs (40) refuse blocked addresses and clients
//!     → Dispatcher
//! ```
//!
//! # Design Decisions
//! - Fail closed: a failed check resolves the request with an error reply
//! - Each middleware only reads and writes named context entries
//! - Reloadable settings live behind `ArcSwap` so config reloads never block requests

pub mod auth;
pub mod block_list;
pub mod classify;
pub mod rate_limit;

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::pipeline::{Pipeline, PipelineBuilder};

pub use auth::{Authenticate, InMemoryTokenStore, TokenStore};
pub use block_list::BlockList;
pub use classify::Classify;
pub use rate_limit::RateLimiter;

pub const CLASSIFY_PRIORITY: i32 = 10;
pub const AUTH_PRIORITY: i32 = 20;
pub const RATE_LIMIT_PRIORITY: i32 = 30;
pub const BLOCK_LIST_PRIORITY: i32 = 40;

/// The canonical middleware set, kept reachable for config reloads.
#[derive(Clone)]
pub struct SecurityLayer {
    pub classify: Arc<Classify>,
    pub tokens: Arc<InMemoryTokenStore>,
    pub auth: Arc<Authenticate>,
    pub rate_limit: Arc<RateLimiter>,
    pub block_list: Arc<BlockList>,
}

impl SecurityLayer {
    pub fn from_config(config: &RelayConfig) -> Self {
        let tokens = Arc::new(InMemoryTokenStore::new(config.auth.tokens.clone()));
        let store: Arc<dyn TokenStore> = tokens.clone();
        Self {
            classify: Arc::new(Classify::new(&config.classification)),
            auth: Arc::new(Authenticate::new(store, config.auth.required)),
            tokens,
            rate_limit: Arc::new(RateLimiter::new(&config.rate_limit)),
            block_list: Arc::new(BlockList::new(&config.block_list)),
        }
    }

    /// Register the four middlewares at their canonical priorities.
    pub fn install(&self, builder: PipelineBuilder) -> PipelineBuilder {
        builder
            .register("classify", CLASSIFY_PRIORITY, self.classify.clone())
            .register("authenticate", AUTH_PRIORITY, self.auth.clone())
            .register("rate_limit", RATE_LIMIT_PRIORITY, self.rate_limit.clone())
            .register("block_list", BLOCK_LIST_PRIORITY, self.block_list.clone())
    }

    pub fn pipeline(&self) -> Pipeline {
        self.install(Pipeline::builder()).build()
    }

    /// Apply the reloadable parts of a new configuration.
    pub fn apply(&self, config: &RelayConfig) {
        self.classify.update(&config.classification);
        self.tokens.replace(config.auth.tokens.clone());
        self.auth.set_required(config.auth.required);
        self.rate_limit.update(&config.rate_limit);
        self.block_list.update(&config.block_list);
        tracing::info!("Security settings reloaded");
    }
}

/// Parse a list of addresses, skipping (and logging) malformed entries.
pub(crate) fn parse_ips(field: &str, values: &[String]) -> std::collections::HashSet<std::net::IpAddr> {
    values
        .iter()
        .filter_map(|v| match v.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!(field, value = %v, "Ignoring malformed address");
                None
            }
        })
        .collect()
}
