//! Side-channel context bag carried through the pipeline.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Well-known context entries.
pub mod keys {
    /// `bool`: the connection was classified as internal.
    pub const INTERNAL: &str = "connection.internal";
    /// `String`: identity the request acts as.
    pub const CLIENT_ID: &str = "auth.client_id";
    /// `bool`: a credential was verified.
    pub const AUTHENTICATED: &str = "auth.authenticated";
}

/// Named values attached to a request by middleware.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextBag {
    entries: HashMap<String, Value>,
}

impl ContextBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn insert<T: Serialize>(&mut self, key: &str, value: T) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.entries.insert(key.to_string(), v);
            }
            Err(e) => tracing::warn!(key, error = %e, "Context value not serializable"),
        }
    }

    /// Typed read. `None` if absent or of another shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.entries
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Value::as_str)
    }

    /// Missing entries read as `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.entries.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
