//! HTTP and WebSocket transport subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum router, trace layer)
//!     → GET /ws?client_id=..&token=..  → websocket.rs (admission, upgrade)
//!           → Correlator per connection → Dispatcher for fresh requests
//!     → GET /status                    → JSON snapshot of peers and services
//! ```

pub mod server;
pub mod websocket;

pub use server::{AppState, PeerTable, RelayServer, StatusReport};
pub use websocket::{ConnectParams, WsChannel};
