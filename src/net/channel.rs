//! Duplex channel boundary.
//!
//! The relay core never touches sockets. A transport adapter implements
//! [`DuplexChannel`] for outbound frames and drives inbound frames, close and
//! error events into the connection's `Correlator`.

use thiserror::Error;

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

/// Outbound half of a connection.
pub trait DuplexChannel: Send + Sync {
    /// Queue one frame for the peer. No retries.
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Ask the transport to close the connection.
    fn close(&self);
}
