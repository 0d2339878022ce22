//! Service hosting subsystem.
//!
//! # Data Flow
//! ```text
//! Registration (system.rs, over /relay/services/*):
//!     RegisterRequest
//!     → registry.rs register_service (quota, routes into the trie)
//!     → hosted.rs Service (status Registered → Running) + queue.rs ServiceQueue
//!
//! Execution:
//!     Dispatcher admits TrackedRequest
//!     → queue.rs bounded channel (fail fast or bounded wait)
//!     → pump acquires a pool.rs WorkerPool permit
//!     → executor.rs Local (in process) or Remote (forward to owner's Correlator)
//!     → TrackedRequest resolved with the reply
//!
//! Owner lost:
//!     registry.rs kill_owner → routes removed, Service Dead, queued/processing work Dead
//! ```
//!
//! # Design Decisions
//! - Quota is enforced at registration time, never at dispatch time
//! - One shared worker pool bounds concurrency across all services
//! - Full route of a service URI is `/{owner}/{service}{short_uri}`

pub mod executor;
pub mod hosted;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod system;
pub mod types;

pub use executor::{Caller, ExecutionResult, Executor, LocalExecutor, RemoteExecutor};
pub use hosted::{Service, ServiceSummary};
pub use pool::WorkerPool;
pub use queue::{AdmissionPolicy, QueueError, QueueSettings, ServiceQueue};
pub use registry::{RegistryError, RegistrySettings, ServiceRegistry, UriDiff};
pub use system::{SystemService, SYSTEM_SERVICE_ID};
pub use types::{AccessType, ExecutionType, ServiceDescriptor, ServiceKind, ServiceStatus};
