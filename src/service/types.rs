//! Service descriptors and status.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Runs in-process.
    Local,
    /// Hosted by a connected peer.
    #[default]
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    #[default]
    Public,
    /// Reachable only from connections classified internal.
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    /// The dispatcher waits for the result and replies directly.
    #[default]
    Sync,
    /// The result is sent to the requester whenever it is ready.
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Unregistered,
    Registered,
    Running,
    Dead,
    Stopping,
    Stopped,
}

impl ServiceStatus {
    pub fn is_final(self) -> bool {
        matches!(self, ServiceStatus::Dead | ServiceStatus::Stopped)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceStatus::Unregistered => "unregistered",
            ServiceStatus::Registered => "registered",
            ServiceStatus::Running => "running",
            ServiceStatus::Dead => "dead",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What a service presents at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: String,
    pub owner_id: String,
    pub short_uris: Vec<String>,
    #[serde(default)]
    pub kind: ServiceKind,
    #[serde(default)]
    pub access: AccessType,
    #[serde(default)]
    pub execution: ExecutionType,
}

impl ServiceDescriptor {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, short_uris: Vec<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            short_uris,
            kind: ServiceKind::Remote,
            access: AccessType::Public,
            execution: ExecutionType::Sync,
        }
    }

    pub fn kind(mut self, kind: ServiceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn access(mut self, access: AccessType) -> Self {
        self.access = access;
        self
    }

    pub fn execution(mut self, execution: ExecutionType) -> Self {
        self.execution = execution;
        self
    }

    /// Registry key: `owner/id`.
    pub fn key(&self) -> String {
        service_key(&self.owner_id, &self.id)
    }

    /// Routable path of one short URI.
    pub fn full_route(&self, short_uri: &str) -> String {
        full_route(&self.owner_id, &self.id, short_uri)
    }
}

pub fn service_key(owner_id: &str, id: &str) -> String {
    format!("{owner_id}/{id}")
}

pub fn full_route(owner_id: &str, id: &str, short_uri: &str) -> String {
    format!("/{owner_id}/{id}{short_uri}")
}
