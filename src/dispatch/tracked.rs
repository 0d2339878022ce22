//! Lifecycle of one in-flight unit of work.
//!
//! ```text
//! Queued ──start_processing──▶ Processing ──resolve──▶ Finished
//!   │  └──────────kill──────────────┴────────kill────▶ Dead
//!   └──cancel──▶ Cancelled
//! ```
//!
//! Every transition and read goes through one mutex, so racing callers
//! (timeout, response, forced kill) see a single linear history. The loser
//! of a race gets [`LifecycleError::AlreadyTerminal`] and the state is left
//! untouched.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;

use crate::protocol::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Processing,
    Finished,
    Dead,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Finished | RequestStatus::Dead | RequestStatus::Cancelled
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Processing => "processing",
            RequestStatus::Finished => "finished",
            RequestStatus::Dead => "dead",
            RequestStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Illegal transition. The tracked item is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("request is already in terminal state {0}")]
    AlreadyTerminal(RequestStatus),

    #[error("request cannot be cancelled while {0}")]
    NotCancellable(RequestStatus),

    #[error("request is not processing (currently {0})")]
    NotProcessing(RequestStatus),

    #[error("request is not queued (currently {0})")]
    NotQueued(RequestStatus),

    #[error("request was never admitted for execution")]
    NotAdmitted,
}

/// How a tracked request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Finished(Message),
    Dead,
    Cancelled,
}

type StatusCallback = Box<dyn Fn(&TrackedRequest, RequestStatus) + Send + Sync>;

struct State {
    status: RequestStatus,
    result: Option<Message>,
    admitted: bool,
}

/// Mutable wrapper around a message representing work in flight.
pub struct TrackedRequest {
    message: Message,
    state: Mutex<State>,
    done: watch::Sender<bool>,
    on_status: Option<StatusCallback>,
    created_at: Instant,
}

impl fmt::Debug for TrackedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedRequest")
            .field("id", &self.message.id())
            .field("status", &self.status())
            .finish()
    }
}

impl TrackedRequest {
    /// A new request in `Queued`.
    pub fn new(message: Message) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            message,
            state: Mutex::new(State {
                status: RequestStatus::Queued,
                result: None,
                admitted: false,
            }),
            done,
            on_status: None,
            created_at: Instant::now(),
        }
    }

    /// Invoke `callback` after every committed transition.
    pub fn with_status_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TrackedRequest, RequestStatus) + Send + Sync + 'static,
    {
        self.on_status = Some(Box::new(callback));
        self
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn id(&self) -> &str {
        self.message.id()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn status(&self) -> RequestStatus {
        self.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Result message, present only once `Finished`.
    pub fn result(&self) -> Option<Message> {
        self.lock().result.clone()
    }

    /// Record that a queue accepted this request; enables [`wait`](Self::wait).
    pub fn mark_admitted(&self) {
        self.lock().admitted = true;
    }

    pub fn is_admitted(&self) -> bool {
        self.lock().admitted
    }

    /// `Queued → Processing`.
    pub fn start_processing(&self) -> Result<(), LifecycleError> {
        self.transition(RequestStatus::Processing, None, |from| match from {
            RequestStatus::Queued => Ok(()),
            other => Err(LifecycleError::NotQueued(other)),
        })
    }

    /// `Queued → Cancelled`. Work already executing cannot be cancelled.
    pub fn cancel(&self) -> Result<(), LifecycleError> {
        self.transition(RequestStatus::Cancelled, None, |from| match from {
            RequestStatus::Queued => Ok(()),
            other => Err(LifecycleError::NotCancellable(other)),
        })
    }

    /// Forced kill from either non-terminal state.
    pub fn kill(&self) -> Result<(), LifecycleError> {
        self.transition(RequestStatus::Dead, None, |_| Ok(()))
    }

    /// `Processing → Finished`, storing the result.
    pub fn resolve(&self, result: Message) -> Result<(), LifecycleError> {
        self.transition(RequestStatus::Finished, Some(result), |from| match from {
            RequestStatus::Processing => Ok(()),
            other => Err(LifecycleError::NotProcessing(other)),
        })
    }

    /// Wait for a terminal state.
    ///
    /// Fails with [`LifecycleError::NotAdmitted`] if the request never
    /// entered a queue; returns at once if it already finished.
    ///
    /// An admitted request may still be `Queued` when the dispatcher starts
    /// waiting, since the pump moves it to `Processing` on its own task. So
    /// admission, not `Processing`, is what makes waiting legal here.
    pub async fn wait(&self) -> Result<Completion, LifecycleError> {
        let mut done = self.done.subscribe();
        {
            let state = self.lock();
            if let Some(completion) = completion_of(&state) {
                return Ok(completion);
            }
            if !state.admitted {
                return Err(LifecycleError::NotAdmitted);
            }
        }

        // The sender lives in `self`, so this cannot observe a closed channel
        // while we hold `&self`.
        let _ = done.wait_for(|finished| *finished).await;
        Ok(completion_of(&self.lock()).unwrap_or(Completion::Dead))
    }

    fn transition<G>(
        &self,
        to: RequestStatus,
        result: Option<Message>,
        guard: G,
    ) -> Result<(), LifecycleError>
    where
        G: FnOnce(RequestStatus) -> Result<(), LifecycleError>,
    {
        {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return Err(LifecycleError::AlreadyTerminal(state.status));
            }
            guard(state.status)?;
            state.status = to;
            if result.is_some() {
                state.result = result;
            }
        }

        if to.is_terminal() {
            self.done.send_replace(true);
        }
        if let Some(callback) = &self.on_status {
            callback(self, to);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn completion_of(state: &State) -> Option<Completion> {
    match state.status {
        RequestStatus::Finished => state.result.clone().map(Completion::Finished),
        RequestStatus::Dead => Some(Completion::Dead),
        RequestStatus::Cancelled => Some(Completion::Cancelled),
        RequestStatus::Queued | RequestStatus::Processing => None,
    }
}
