//! Sliding-window aggregator.
//!
//! Batches bursts of per-chat events into a single downstream notification.
//! Every `add` or `touch` re-arms the chat's countdown; when a window elapses
//! with no further activity the batch closes and, if it counted at least one
//! message, the observer's `on_flush` fires exactly once.
//!
//! Each batch carries a generation counter. A window is re-armed in place only
//! when cancelling the pending timer succeeds; otherwise the generation is
//! bumped and a new timer bound to it is scheduled. The fire handler drops any
//! firing whose generation no longer matches, so a timer that was already on
//! its way when a reset arrived never flushes.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, trace};

use crate::pipeline::scheduler::{Scheduler, TimerHandle};

/// Why a batch's window was (re)started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// The batch was just created.
    Start,
    /// `add`: the count was incremented.
    Message,
    /// `touch`: activity without a new message.
    Typing,
}

impl ResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Message => "message",
            Self::Typing => "typing",
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives aggregator notifications.
pub trait BatchObserver: Send + Sync {
    /// A window closed with `count > 0` pending messages.
    ///
    /// Called without the aggregator lock held; may call back into the
    /// aggregator.
    fn on_flush(&self, chat: &str, count: u32);

    /// A window started or was re-armed.
    ///
    /// Called with the aggregator lock held so per-chat notifications keep
    /// arrival order. Must not call back into the aggregator.
    fn on_reset(&self, _chat: &str, _reason: ResetReason, _count: u32, _window: Duration) {}
}

struct Batch {
    count: u32,
    timer: Option<Box<dyn TimerHandle>>,
    generation: u64,
}

struct Inner {
    batches: Mutex<HashMap<String, Batch>>,
    window: Duration,
    scheduler: Arc<dyn Scheduler>,
    observer: Arc<dyn BatchObserver>,
}

/// Per-chat sliding-window debouncer.
///
/// Cheap to clone; clones share state. Pending windows hold only a weak
/// reference, so dropping the last clone abandons them.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    pub fn new(
        window: Duration,
        scheduler: Arc<dyn Scheduler>,
        observer: Arc<dyn BatchObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                batches: Mutex::new(HashMap::new()),
                window,
                scheduler,
                observer,
            }),
        }
    }

    /// Count one message for `chat` and restart its window.
    pub fn add(&self, chat: &str) {
        self.bump(chat, ResetReason::Message);
    }

    /// Restart `chat`'s window without counting a message.
    pub fn touch(&self, chat: &str) {
        self.bump(chat, ResetReason::Typing);
    }

    /// Alias of [`touch`](Self::touch) for "user is typing" events.
    pub fn touch_typing(&self, chat: &str) {
        self.touch(chat);
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Pending count of `chat`'s open batch, if any.
    pub fn pending(&self, chat: &str) -> Option<u32> {
        self.inner.lock().get(chat).map(|b| b.count)
    }

    /// Number of chats with an open batch.
    pub fn active_chats(&self) -> usize {
        self.inner.lock().len()
    }

    #[cfg(test)]
    fn generation(&self, chat: &str) -> Option<u64> {
        self.inner.lock().get(chat).map(|b| b.generation)
    }

    fn bump(&self, chat: &str, reason: ResetReason) {
        if chat.is_empty() {
            return;
        }

        let inner = &self.inner;
        let mut batches = inner.lock();

        let batch = match batches.entry(chat.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                inner
                    .observer
                    .on_reset(chat, ResetReason::Start, 0, inner.window);
                entry.insert(Batch {
                    count: 0,
                    timer: None,
                    generation: 0,
                })
            }
        };

        if reason == ResetReason::Message {
            batch.count = batch.count.saturating_add(1);
        }
        Inner::rearm(inner, chat, batch);

        trace!(chat = %chat, reason = %reason, count = batch.count, "Aggregation window reset");
        inner.observer.on_reset(chat, reason, batch.count, inner.window);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Batch>> {
        // Observer panics must not wedge every chat.
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restart `batch`'s window. Caller holds the lock.
    fn rearm(inner: &Arc<Inner>, chat: &str, batch: &mut Batch) {
        if let Some(timer) = batch.timer.take() {
            if timer.cancel() {
                // The old callback can never run, so its generation stays valid.
                batch.timer = Some(Self::arm(inner, chat, batch.generation));
                return;
            }
        }

        batch.generation += 1;
        batch.timer = Some(Self::arm(inner, chat, batch.generation));
    }

    fn arm(inner: &Arc<Inner>, chat: &str, generation: u64) -> Box<dyn TimerHandle> {
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let chat = chat.to_string();
        inner.scheduler.schedule(
            inner.window,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(&chat, generation);
                }
            }),
        )
    }

    /// Window-close handler for the timer armed with `generation`.
    fn fire(&self, chat: &str, generation: u64) {
        let count = {
            let mut batches = self.lock();
            if batches.get(chat).is_none_or(|b| b.generation != generation) {
                trace!(chat = %chat, generation, "Discarding stale aggregation timer");
                return;
            }
            // Removal and final count read share one lock acquisition.
            match batches.remove(chat) {
                Some(batch) => batch.count,
                None => return,
            }
        };

        if count == 0 {
            debug!(chat = %chat, "Aggregation window closed with no messages");
            return;
        }

        debug!(chat = %chat, count, "Aggregation window closed");
        self.observer.on_flush(chat, count);
    }
}
