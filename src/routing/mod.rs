//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Service registration:
//!     "/owner/service/items/:id" → trie.rs (walk/create nodes)
//!     → pure-literal leaves queued for compaction
//!     → compaction hoists them into a flat path → value map
//!
//! Lookup:
//!     "/owner/service/items/42?verbose=1"
//!     → query.rs (split and parse "verbose=1")
//!     → constant map (O(1)) or trie walk (literal → parameter → wildcard)
//!     → MatchContext { params, query, value } or RoutingError::NotFound
//! ```
//!
//! # Design Decisions
//! - Nodes live in an arena addressed by index; parents are indices too
//! - Literal children beat the parameter child, which beats the wildcard child
//! - The walk backtracks, so compaction never changes a match result
//! - No locking here; the owner wraps the router in a reader/writer lock

pub mod query;
pub mod trie;

pub use query::parse_query;
pub use trie::{MatchContext, TrieRouter, DEFAULT_COMPACTION_THRESHOLD};

use thiserror::Error;

/// Routing failures. Each variant is a distinct condition callers branch on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// A node already branches into a capture with a different name.
    #[error("segment {segment} conflicts with an existing capture at the same position")]
    DuplicateCapture { segment: String },

    /// The same parameter name appears twice in one path.
    #[error("parameter {name} is declared more than once")]
    DuplicateParameter { name: String },

    /// The path already holds a value and override was not requested.
    #[error("path {path} is already registered")]
    AlreadyRegistered { path: String },

    /// A query pair is not of the form `key=value`.
    #[error("malformed query pair {pair:?}")]
    MalformedQuery { pair: String },

    /// Nothing routes the path.
    #[error("no route found for {path}")]
    NotFound { path: String },

    /// The pattern itself is unusable.
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
}
