//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Logging/metrics → RelayServer::new → Bind → Serve
//!
//! Shutdown:
//!     signals.rs (SIGINT/SIGTERM)
//!     → stop accepting (axum graceful shutdown)
//!     → shutdown.rs broadcast: connection loops, health monitor, reload loop exit
//!     → drain connections (bounded by the grace period)
//!     → stop every service, killing its queued and running work
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Draining has a deadline; services are stopped regardless

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
