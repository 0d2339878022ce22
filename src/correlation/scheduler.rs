//! Delayed callbacks for request deadlines.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;

/// Schedules and cancels delayed callbacks.
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay` unless cancelled first.
    fn after(&self, delay: Duration, task: Box<dyn FnOnce() + Send + 'static>) -> TimerHandle;

    /// Cancel a scheduled task. Cancelling a fired or cancelled timer is a no-op.
    fn cancel(&self, handle: &TimerHandle);
}

/// Cancellable handle for a scheduled task.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Scheduler backed by the tokio timer wheel.
///
/// `after` must be called from within a tokio runtime.
#[derive(Debug, Default)]
pub struct TokioScheduler {
    next_id: AtomicU64,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: Box<dyn FnOnce() + Send + 'static>) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);

        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                task();
            }
        });

        TimerHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            cancelled,
            abort: Some(join.abort_handle()),
        }
    }

    fn cancel(&self, handle: &TimerHandle) {
        handle.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &handle.abort {
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let scheduler = TokioScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);

        scheduler.after(Duration::from_secs(5), Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let scheduler = TokioScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);

        let handle = scheduler.after(Duration::from_secs(1), Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        scheduler.cancel(&handle);
        scheduler.cancel(&handle);
        assert!(handle.is_cancelled());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
