//! Request/response correlation subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound request:
//!     correlator.rs request(msg)
//!     → registry.rs once(msg.id)          (armed before sending)
//!     → DuplexChannel::send
//!     → scheduler.rs after(timeout)        (deadline)
//!     → caller awaits: response | timeout | connection closed
//!
//! Inbound frame:
//!     correlator.rs handle_frame(bytes)
//!     → decode → registry.rs notify(id)
//!     → delivered to a listener, discarded (late reply), or returned as a fresh request
//! ```
//!
//! # Design Decisions
//! - Responses are matched by id only, never by arrival order
//! - Delivery and timeout race on one slot; the first to complete it wins
//! - Closing a connection fails every pending request instead of leaving it hanging
//! - A timed-out request fails alone; only transport errors close the connection

pub mod correlator;
pub mod registry;
pub mod scheduler;

pub use correlator::{CorrelationError, Correlator, Inbound};
pub use registry::{ListenerId, NotificationRegistry, Subscription};
pub use scheduler::{Scheduler, TimerHandle, TokioScheduler};
