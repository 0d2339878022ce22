//! Bounded per-service execution queue.
//!
//! # Responsibilities
//! - Admit tracked requests into a bounded channel under an admission policy
//! - Pump admitted work onto the shared worker pool
//! - Kill everything queued or processing when the service goes away
//!
//! # Design Decisions
//! - A full queue rejects (fail fast) or waits a bounded time; it never grows
//! - Items killed while queued are skipped by the pump, not executed
//! - A stopped pump kills whatever is still buffered
//! - Execution runs on its own task holding a pool permit until it finishes

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tracing::{debug, trace};

use crate::config::{AdmissionMode, ServicesConfig};
use crate::dispatch::TrackedRequest;
use crate::protocol::{Message, ServiceRequest, RELAY_ID};

use super::executor::{Caller, Executor};
use super::pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    FailFast,
    /// Wait at most this long for room.
    Block(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub capacity: usize,
    pub policy: AdmissionPolicy,
}

impl From<&ServicesConfig> for QueueSettings {
    fn from(config: &ServicesConfig) -> Self {
        let policy = match config.admission {
            AdmissionMode::FailFast => AdmissionPolicy::FailFast,
            AdmissionMode::Block => {
                AdmissionPolicy::Block(Duration::from_millis(config.admission_timeout_ms))
            }
        };
        Self {
            capacity: config.queue_capacity.max(1),
            policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("queue is closed")]
    Closed,
}

struct Job {
    key: u64,
    tracked: Arc<TrackedRequest>,
    caller: Caller,
    request: ServiceRequest,
}

type Inflight = Arc<DashMap<u64, Arc<TrackedRequest>>>;

/// Bounded queue feeding one service's executor.
pub struct ServiceQueue {
    service_id: String,
    tx: mpsc::Sender<Job>,
    inflight: Inflight,
    policy: AdmissionPolicy,
    capacity: usize,
    shutdown: watch::Sender<bool>,
    next_key: AtomicU64,
}

impl std::fmt::Debug for ServiceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceQueue")
            .field("service_id", &self.service_id)
            .field("capacity", &self.capacity)
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

impl ServiceQueue {
    /// Create the queue and spawn its pump. Must be called inside a tokio runtime.
    pub fn start(
        service_id: impl Into<String>,
        executor: Arc<dyn Executor>,
        pool: WorkerPool,
        settings: QueueSettings,
    ) -> Self {
        let service_id = service_id.into();
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inflight: Inflight = Arc::new(DashMap::new());

        tokio::spawn(pump(
            service_id.clone(),
            rx,
            executor,
            pool,
            Arc::clone(&inflight),
            shutdown_rx,
        ));

        Self {
            service_id,
            tx,
            inflight,
            policy: settings.policy,
            capacity: settings.capacity.max(1),
            shutdown,
            next_key: AtomicU64::new(0),
        }
    }

    /// Admit a queued request. On rejection the request is cancelled.
    pub async fn admit(
        &self,
        tracked: Arc<TrackedRequest>,
        caller: Caller,
        request: ServiceRequest,
    ) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        tracked.mark_admitted();
        self.inflight.insert(key, Arc::clone(&tracked));

        let job = Job {
            key,
            tracked: Arc::clone(&tracked),
            caller,
            request,
        };
        let sent = match self.policy {
            AdmissionPolicy::FailFast => self.tx.try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Full,
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            }),
            AdmissionPolicy::Block(wait) => {
                match tokio::time::timeout(wait, self.tx.send(job)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(QueueError::Closed),
                    Err(_) => Err(QueueError::Full),
                }
            }
        };

        if let Err(e) = sent {
            self.inflight.remove(&key);
            let _ = tracked.cancel();
            debug!(service = %self.service_id, message_id = %tracked.id(), error = %e, "Admission refused");
            return Err(e);
        }
        Ok(())
    }

    /// Force every queued or processing request to `Dead`.
    pub fn kill_all(&self) -> usize {
        let keys: Vec<u64> = self.inflight.iter().map(|e| *e.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.inflight.remove(&key))
            .filter(|(_, tracked)| tracked.kill().is_ok())
            .count()
    }

    /// Stop the pump. Admissions fail from now on.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.tx.is_closed()
    }

    /// Admitted requests that have not reached a terminal state.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

async fn pump(
    service_id: String,
    mut rx: mpsc::Receiver<Job>,
    executor: Arc<dyn Executor>,
    pool: WorkerPool,
    inflight: Inflight,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => None,
            permit = pool.acquire() => permit.ok(),
        };
        let Some(permit) = permit else {
            abandon(&inflight, job);
            break;
        };

        if job.tracked.start_processing().is_err() {
            // Killed or cancelled while waiting in the queue.
            trace!(service = %service_id, message_id = %job.tracked.id(), "Skipping terminal job");
            inflight.remove(&job.key);
            continue;
        }

        tokio::spawn(run_job(
            service_id.clone(),
            job,
            Arc::clone(&executor),
            Arc::clone(&inflight),
            permit,
        ));
    }
    rx.close();
    let mut drained = 0;
    while let Ok(job) = rx.try_recv() {
        abandon(&inflight, job);
        drained += 1;
    }
    debug!(service = %service_id, drained, "Queue pump stopped");
}

/// Kill a job the pump will never run.
fn abandon(inflight: &Inflight, job: Job) {
    inflight.remove(&job.key);
    let _ = job.tracked.kill();
}

async fn run_job(
    service_id: String,
    job: Job,
    executor: Arc<dyn Executor>,
    inflight: Inflight,
    permit: OwnedSemaphorePermit,
) {
    let Job {
        key,
        tracked,
        caller,
        request,
    } = job;

    let reply = match executor.execute(caller, request).await {
        Ok(body) => Message::response_to(tracked.message(), RELAY_ID, body),
        Err(error) => Message::error_to(tracked.message(), RELAY_ID, &error),
    };
    drop(permit);

    if let Err(e) = tracked.resolve(reply) {
        debug!(service = %service_id, message_id = %tracked.id(), error = %e, "Result discarded");
    }
    inflight.remove(&key);
}
