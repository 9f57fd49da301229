use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::lock;

/// Handle returned by [`Scheduler::schedule`], used to cancel the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

pub type TimerTask = BoxFuture<'static, ()>;

/// Timer service used for delayed syncs.
///
/// Implementations must let `cancel_all` stop every outstanding task so a
/// repository can be disposed deterministically.
pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerId;

    /// Cancel a timer. Returns false if it already fired to completion or was unknown.
    fn cancel(&self, id: TimerId) -> bool;

    /// Cancel every outstanding timer, returning how many were stopped
    fn cancel_all(&self) -> usize;

    /// Number of timers that have not yet completed
    fn pending(&self) -> usize;

    /// Wait for `delay` on this scheduler's clock. Resolves to `false` if the
    /// timer was cancelled (including by `cancel_all`) before it fired.
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, bool> {
        let (tx, rx) = oneshot::channel();
        self.schedule(
            delay,
            Box::pin(async move {
                let _ = tx.send(());
            }),
        );
        Box::pin(async move { rx.await.is_ok() })
    }
}

/// [`Scheduler`] backed by spawned tokio tasks.
///
/// A task stays tracked until its body finishes, so `cancel_all` also stops a
/// delayed sync that is already talking to the remote store. Under a paused
/// tokio clock the delays are virtual.
pub struct TokioScheduler {
    next_id: AtomicU64,
    timers: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let timers = Arc::clone(&self.timers);

        // Hold the map while spawning so the task cannot deregister before it is registered
        let mut guard = lock(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
            lock(&timers).remove(&id);
        });
        guard.insert(id, handle);
        trace!(timer = %id, delay_ms = delay.as_millis() as u64, "Timer scheduled");
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        match lock(&self.timers).remove(&id) {
            Some(handle) => {
                let running = !handle.is_finished();
                handle.abort();
                trace!(timer = %id, "Timer cancelled");
                running
            }
            None => false,
        }
    }

    fn cancel_all(&self) -> usize {
        let handles: Vec<JoinHandle<()>> = lock(&self.timers).drain().map(|(_, h)| h).collect();
        let mut cancelled = 0;
        for handle in handles {
            if !handle.is_finished() {
                cancelled += 1;
            }
            handle.abort();
        }
        cancelled
    }

    fn pending(&self) -> usize {
        let mut timers = lock(&self.timers);
        timers.retain(|_, handle| !handle.is_finished());
        timers.len()
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
