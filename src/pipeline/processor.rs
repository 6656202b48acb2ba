//! Message pipeline — aggregates inbound envelopes and answers each closed batch.
//!
//! Flow:
//! 1. `ingest()` — message events count toward the chat's batch, typing
//!    events only extend its window
//! 2. Aggregator flush — the batch closed, hand its latest envelope on
//! 3. Rules engine — pick at most one reply
//! 4. Reply sink — deliver it (collaborator)

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::pipeline::aggregator::{Aggregator, BatchObserver, ResetReason};
use crate::pipeline::builtin::builtin_rules;
use crate::pipeline::rules::RuleEngine;
use crate::pipeline::scheduler::{Scheduler, TokioScheduler};
use crate::pipeline::types::{ActionResult, Envelope, EventType, ReplySink};
use crate::pipeline::webhook::FileProfileStore;

/// Observes the aggregator and runs the rules for every closed batch.
struct FlushDispatcher {
    engine: Arc<RuleEngine>,
    sink: Arc<dyn ReplySink>,
    /// Counted message envelopes per chat, oldest first, not yet flushed.
    queued: Mutex<HashMap<String, VecDeque<Envelope>>>,
    runtime: Handle,
}

impl FlushDispatcher {
    fn queued(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Envelope>>> {
        self.queued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the `count` oldest envelopes of `chat` and return the last of them.
    fn take(&self, chat: &str, count: u32) -> Option<Envelope> {
        let mut queued = self.queued();
        let queue = queued.get_mut(chat)?;
        let take = (count as usize).min(queue.len());
        let latest = queue.drain(..take).last();
        if queue.is_empty() {
            queued.remove(chat);
        }
        latest
    }
}

impl BatchObserver for FlushDispatcher {
    fn on_flush(&self, chat: &str, count: u32) {
        let Some(envelope) = self.take(chat, count) else {
            debug!(chat = %chat, count, "Batch closed without a stored envelope");
            return;
        };

        let engine = Arc::clone(&self.engine);
        let sink = Arc::clone(&self.sink);
        self.runtime
            .spawn(async move { answer_batch(engine, sink, envelope, count).await });
    }

    fn on_reset(&self, chat: &str, reason: ResetReason, count: u32, window: Duration) {
        debug!(
            chat = %chat,
            reason = %reason,
            count,
            window_ms = window.as_millis() as u64,
            "Aggregation window armed"
        );
    }
}

/// Evaluate a closed batch and dispatch the reply, if any.
async fn answer_batch(
    engine: Arc<RuleEngine>,
    sink: Arc<dyn ReplySink>,
    envelope: Envelope,
    count: u32,
) {
    let (result, handled) = engine.evaluate(&envelope).await;
    if !handled || result.reply.trim().is_empty() {
        info!(chat = %envelope.chat_jid, count, "No rule handled batch");
        return;
    }

    let result = result.with_meta("batch_count", count.to_string());
    info!(chat = %envelope.chat_jid, count, "Dispatching reply");
    if let Err(e) = sink.send_reply(&envelope.chat_jid, &result).await {
        error!(chat = %envelope.chat_jid, error = %e, "Failed to dispatch reply");
    }
}

/// Transport → aggregator → rules → reply sink.
pub struct MessagePipeline {
    aggregator: Aggregator,
    dispatcher: Arc<FlushDispatcher>,
}

impl MessagePipeline {
    /// Build a pipeline. Replies are answered on `runtime`.
    pub fn new(
        window: Duration,
        scheduler: Arc<dyn Scheduler>,
        engine: Arc<RuleEngine>,
        sink: Arc<dyn ReplySink>,
        runtime: Handle,
    ) -> Self {
        let dispatcher = Arc::new(FlushDispatcher {
            engine,
            sink,
            queued: Mutex::new(HashMap::new()),
            runtime,
        });
        let aggregator = Aggregator::new(
            window,
            scheduler,
            Arc::clone(&dispatcher) as Arc<dyn BatchObserver>,
        );
        Self {
            aggregator,
            dispatcher,
        }
    }

    /// Pipeline with the builtin rules and file-backed profiles, on the
    /// current tokio runtime.
    pub fn from_config(config: AppConfig, sink: Arc<dyn ReplySink>) -> Self {
        let profiles = Arc::new(FileProfileStore::new(config.profiles_dir));
        let engine = RuleEngine::new(builtin_rules(Arc::new(config.webhook), profiles));
        let scheduler = TokioScheduler::current();
        let runtime = Handle::current();

        Self::new(
            config.aggregator_window,
            Arc::new(scheduler),
            Arc::new(engine),
            sink,
            runtime,
        )
    }

    /// Feed one transport event into the pipeline.
    pub fn ingest(&self, envelope: Envelope) -> Result<(), PipelineError> {
        if envelope.chat_jid.trim().is_empty() {
            return Err(PipelineError::Input("envelope has no chat_jid".into()));
        }

        match envelope.event_type {
            EventType::Message => {
                // Queue and count under one guard so envelopes line up with
                // batch counts even when a window closes concurrently.
                let chat = envelope.chat_jid.clone();
                let mut queued = self.dispatcher.queued();
                queued.entry(chat.clone()).or_default().push_back(envelope);
                self.aggregator.add(&chat);
            }
            EventType::Typing => self.aggregator.touch_typing(&envelope.chat_jid),
            EventType::Other => {
                debug!(chat = %envelope.chat_jid, "Ignoring non-message event");
            }
        }
        Ok(())
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }
}

// ── Channel sink ────────────────────────────────────────────────────

/// Reply handed to the transport.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingReply {
    pub chat_jid: String,
    pub reply: String,
    pub meta: HashMap<String, String>,
}

/// [`ReplySink`] that queues replies on an mpsc channel.
pub struct ChannelSink {
    tx: mpsc::Sender<OutgoingReply>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<OutgoingReply>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ReplySink for ChannelSink {
    async fn send_reply(&self, chat_jid: &str, result: &ActionResult) -> Result<(), PipelineError> {
        let reply = OutgoingReply {
            chat_jid: chat_jid.to_string(),
            reply: result.reply.clone(),
            meta: result.meta.clone(),
        };
        self.tx.send(reply).await.map_err(|e| PipelineError::ReplySend {
            chat: chat_jid.to_string(),
            reason: e.to_string(),
        })
    }
}
