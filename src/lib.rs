//! Message relay library.
//!
//! Peers connect over WebSocket, register named services, and call each
//! other's services by URI. The relay correlates requests with responses,
//! routes URIs through a trie, queues work per service on a shared worker
//! pool, and runs every fresh request through a security pipeline first.

// Core
pub mod correlation;
pub mod dispatch;
pub mod protocol;
pub mod routing;
pub mod service;

// Edges
pub mod config;
pub mod http;
pub mod net;
pub mod pipeline;
pub mod security;

// Cross-cutting concerns
pub mod health;
pub mod lifecycle;
pub mod observability;

pub use config::RelayConfig;
pub use correlation::Correlator;
pub use dispatch::Dispatcher;
pub use http::RelayServer;
pub use lifecycle::Shutdown;
pub use protocol::{Message, MessageType};
pub use service::ServiceRegistry;
