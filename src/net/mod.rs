//! Network boundary subsystem.
//!
//! # Data Flow
//! ```text
//! Transport adapter (http::websocket)
//!     → connection.rs (ConnectionId, ConnectionInfo, tracker guard)
//!     → channel.rs (DuplexChannel: outbound frames, close)
//!     → Correlator owns the channel for the connection's lifetime
//! ```
//!
//! # Design Decisions
//! - Transports are adapters; the core only sees DuplexChannel
//! - Each connection is tracked for admission limits and draining
//! - Sends never retry; callers one layer up decide

pub mod channel;
pub mod connection;

pub use channel::{DuplexChannel, TransportError};
pub use connection::{ConnectionGuard, ConnectionId, ConnectionInfo, ConnectionTracker};
