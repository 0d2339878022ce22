//! Dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound::Request(message)
//!     → dispatcher.rs
//!         ping            → pong
//!         decode payload  → ServiceRequest (bad_request on failure)
//!         Pipeline::run   → early reply if a middleware resolved it
//!         ServiceRegistry::find_service_by_uri
//!         access / status checks
//!         TrackedRequest (tracked.rs) admitted to the service queue
//!     sync service  → wait() → reply now
//!     async service → reply later, sent through the requester's Correlator
//! ```
//!
//! # Design Decisions
//! - Every dispatch failure becomes an error reply to the requester
//! - The service queue owns the tracked request; the requester only sees messages

pub mod dispatcher;
pub mod tracked;

pub use dispatcher::{DispatchError, Dispatcher, Outcome};
pub use tracked::{Completion, LifecycleError, RequestStatus, TrackedRequest};
