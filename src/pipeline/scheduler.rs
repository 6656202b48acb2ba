//! Delayed-callback scheduling for aggregation windows.
//!
//! The aggregator only needs two capabilities: run a callback after a
//! duration, and try to cancel it before it runs. [`TokioScheduler`] backs
//! them with spawned tokio tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Callback run when a scheduled delay elapses.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Schedules delayed callbacks.
///
/// Implementations must never run `task` synchronously inside `schedule`:
/// the aggregator calls it while holding its lock.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, after: Duration, task: Task) -> Box<dyn TimerHandle>;
}

/// Handle to one scheduled callback.
pub trait TimerHandle: Send {
    /// Try to cancel the callback.
    ///
    /// Returns `true` only if the callback has not started and never will.
    /// `false` means it already fired (or is firing) or was cancelled before.
    fn cancel(&self) -> bool;
}

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Scheduler backed by `tokio::time::sleep` on a runtime handle.
///
/// The handle is captured at construction, so timers can be armed from
/// threads that are not part of the runtime.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler on the runtime of the calling task.
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, after: Duration, task: Task) -> Box<dyn TimerHandle> {
        let state = Arc::new(AtomicU8::new(PENDING));
        let task_state = Arc::clone(&state);

        let join = self.handle.spawn(async move {
            tokio::time::sleep(after).await;
            // Whoever flips PENDING first wins: either this firing or a cancel.
            if task_state
                .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                task();
            }
        });

        Box::new(TokioTimer { state, join })
    }
}

struct TokioTimer {
    state: Arc<AtomicU8>,
    join: JoinHandle<()>,
}

impl TimerHandle for TokioTimer {
    fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.join.abort();
        }
        cancelled
    }
}
