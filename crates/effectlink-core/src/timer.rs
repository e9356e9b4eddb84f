//! Shared timer service for delayed work: effect completion, request
//! timeouts, retry resends and shutdown grace periods.
//!
//! Every scheduled job is an independent tokio task sleeping on
//! `tokio::time`, so each can be cancelled on its own and tests can drive
//! the clock with `#[tokio::test(start_paused = true)]`.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// Schedules futures to run after a delay.
///
/// Cheap to clone; clones share nothing but the runtime the jobs run on.
#[derive(Debug, Clone, Default)]
pub struct TimerService {
    _priv: (),
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `job` once `delay` has elapsed, unless the returned handle is
    /// cancelled first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        trace!(?delay, "scheduling timer");
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            job.await;
        });
        TimerHandle { task }
    }
}

/// Handle to one scheduled job.
///
/// Dropping the handle does **not** cancel the job; call [`cancel`](Self::cancel).
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancels exactly this job.  Calling it again, or after the job ran, is a no-op.
    ///
    /// A job that already started running is aborted at its next await point.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Returns `true` once the job has run to completion or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_after_delay() {
        let timer = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let handle = timer.schedule(Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_only_that_job() {
        let timer = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let a = Arc::clone(&fired);
        let cancelled = timer.schedule(Duration::from_secs(1), async move {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let b = Arc::clone(&fired);
        let _kept = timer.schedule(Duration::from_secs(1), async move {
            b.fetch_add(10, Ordering::SeqCst);
        });

        cancelled.cancel();
        cancelled.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }
}
