//! Middleware pipeline subsystem.
//!
//! # Data Flow
//! ```text
//! Fresh request (from the connection read loop)
//!     → request.rs   IncomingRequest { tracked (Processing), ServiceRequest, ContextBag }
//!     → chain.rs     Pipeline::run, ascending priority:
//!                      classify(10) → authenticate(20) → rate limit(30) → block list(40)
//!     → halted early if a middleware resolved the request
//!     → otherwise handed to the Dispatcher
//! ```
//!
//! # Design Decisions
//! - Middleware is ordered by (priority, registration order)
//! - A middleware stops the chain by resolving the request, never by returning an error
//! - Middlewares share state only through named context bag entries

pub mod chain;
pub mod context;
pub mod request;

pub use chain::{Middleware, MiddlewareDescriptor, Pipeline, PipelineBuilder};
pub use context::{keys, ContextBag};
pub use request::IncomingRequest;
