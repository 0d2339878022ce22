//! A registered service and its status machine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;
use tracing::info;

use crate::dispatch::TrackedRequest;
use crate::protocol::ServiceRequest;

use super::executor::{Caller, Executor};
use super::pool::WorkerPool;
use super::queue::{QueueError, QueueSettings, ServiceQueue};
use super::types::{AccessType, ExecutionType, ServiceDescriptor, ServiceKind, ServiceStatus};

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceSummary {
    pub id: String,
    pub owner_id: String,
    pub kind: ServiceKind,
    pub access: AccessType,
    pub execution: ExecutionType,
    pub status: ServiceStatus,
    pub routes: Vec<String>,
    pub inflight: usize,
}

pub struct Service {
    id: String,
    owner_id: String,
    kind: ServiceKind,
    access: AccessType,
    execution: ExecutionType,
    short_uris: RwLock<Vec<String>>,
    status: Mutex<ServiceStatus>,
    queue: ServiceQueue,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("status", &self.status())
            .finish()
    }
}

impl Service {
    /// Build the service and start its queue. Status is `Registered`.
    pub fn start(
        descriptor: ServiceDescriptor,
        executor: Arc<dyn Executor>,
        pool: WorkerPool,
        settings: QueueSettings,
    ) -> Self {
        let queue = ServiceQueue::start(descriptor.key(), executor, pool, settings);
        Self {
            id: descriptor.id,
            owner_id: descriptor.owner_id,
            kind: descriptor.kind,
            access: descriptor.access,
            execution: descriptor.execution,
            short_uris: RwLock::new(descriptor.short_uris),
            status: Mutex::new(ServiceStatus::Registered),
            queue,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn access(&self) -> AccessType {
        self.access
    }

    pub fn execution(&self) -> ExecutionType {
        self.execution
    }

    pub fn short_uris(&self) -> Vec<String> {
        self.short_uris
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_short_uris(&self, uris: Vec<String>) {
        *self.short_uris.write().unwrap_or_else(PoisonError::into_inner) = uris;
    }

    /// Full routes currently served.
    pub fn routes(&self) -> Vec<String> {
        self.short_uris()
            .iter()
            .map(|short| super::types::full_route(&self.owner_id, &self.id, short))
            .collect()
    }

    pub fn status(&self) -> ServiceStatus {
        *self.lock_status()
    }

    pub fn is_accepting(&self) -> bool {
        self.status() == ServiceStatus::Running
    }

    pub fn queue(&self) -> &ServiceQueue {
        &self.queue
    }

    /// `Registered → Running`.
    pub(crate) fn mark_running(&self) -> bool {
        let mut status = self.lock_status();
        if *status != ServiceStatus::Registered {
            return false;
        }
        *status = ServiceStatus::Running;
        true
    }

    pub async fn admit(
        &self,
        tracked: Arc<TrackedRequest>,
        caller: Caller,
        request: ServiceRequest,
    ) -> Result<(), QueueError> {
        if !self.is_accepting() {
            return Err(QueueError::Closed);
        }
        self.queue.admit(tracked, caller, request).await
    }

    /// Owner lost: mark `Dead` and kill all queued and processing work.
    pub fn kill(&self) -> usize {
        {
            let mut status = self.lock_status();
            if status.is_final() {
                return 0;
            }
            *status = ServiceStatus::Dead;
        }
        let killed = self.queue.kill_all();
        self.queue.close();
        info!(service = %self.id, owner = %self.owner_id, killed, "Service killed");
        killed
    }

    /// Orderly stop: `Stopping`, kill outstanding work, then `Stopped`.
    pub fn stop(&self) -> usize {
        {
            let mut status = self.lock_status();
            if status.is_final() || *status == ServiceStatus::Stopping {
                return 0;
            }
            *status = ServiceStatus::Stopping;
        }
        let killed = self.queue.kill_all();
        self.queue.close();
        *self.lock_status() = ServiceStatus::Stopped;
        info!(service = %self.id, owner = %self.owner_id, killed, "Service stopped");
        killed
    }

    pub fn summary(&self) -> ServiceSummary {
        ServiceSummary {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            kind: self.kind,
            access: self.access,
            execution: self.execution,
            status: self.status(),
            routes: self.routes(),
            inflight: self.queue.inflight(),
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, ServiceStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
