//! Wire protocol subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound frame (bytes)
//!     → codec.rs (decode)
//!     → message.rs (Message: id, from, to, type, payload)
//!     → Correlator (responses) or Dispatcher (fresh requests)
//!
//! Outbound:
//!     Message::response_to / Message::error_to (same id as the request)
//!     → codec.rs (encode)
//!     → DuplexChannel::send
//! ```
//!
//! # Design Decisions
//! - Messages are immutable once built; responses are new values
//! - The message id is the whole correlation protocol: a response reuses it
//! - Encoding lives in one place so any other codec can honour the same contract

pub mod codec;
pub mod message;

pub use codec::{decode, decode_payload, encode, encode_payload, peek_id, CodecError};
pub use message::{ErrorBody, ErrorCode, Message, MessageType, ServiceRequest};

/// Peer id the relay uses in the `from` field of messages it originates.
pub const RELAY_ID: &str = "relay";
