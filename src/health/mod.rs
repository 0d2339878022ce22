//! Peer health subsystem.
//!
//! # Data Flow
//! ```text
//! Periodic timer (active.rs)
//!     → Ping every peer hosting a service, through its Correlator
//!     → Pong within the timeout resets the failure count
//!     → Consecutive failures past the threshold:
//!         ServiceRegistry::kill_owner → Correlator::close
//! ```
//!
//! # Design Decisions
//! - Only service hosts are probed; plain clients cost nothing
//! - Eviction needs consecutive failures, so one slow pong is tolerated
//! - Probes reuse the correlation layer, not a side channel

pub mod active;

pub use active::HealthMonitor;
