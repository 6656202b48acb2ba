//! Shared types for the message processing pipeline.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Suffix carried by group-chat identifiers.
pub const GROUP_SUFFIX: &str = "@g.us";

// ── Envelope ────────────────────────────────────────────────────────

/// Kind of chat event carried by an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A user message. Counts toward the chat's batch.
    Message,
    /// "User is typing". Extends the window without counting.
    Typing,
    /// Receipts, presence and anything else the transport forwards.
    #[serde(other)]
    Other,
}

/// One normalized chat event.
///
/// The transport converts its native events into this struct. It is
/// read-only once built and cloned freely through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_type: EventType,
    /// Conversation identifier; batches and rules key off this.
    pub chat_jid: String,
    #[serde(default)]
    pub sender_jid: String,
    #[serde(default)]
    pub chat_name: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default = "Utc::now")]
    pub at: DateTime<Utc>,
}

impl Envelope {
    /// Build a message envelope stamped with the current time.
    pub fn message(chat_jid: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Message,
            chat_jid: chat_jid.into(),
            sender_jid: String::new(),
            chat_name: String::new(),
            message_id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            at: Utc::now(),
        }
    }

    /// Build a typing envelope stamped with the current time.
    pub fn typing(chat_jid: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Typing,
            ..Self::message(chat_jid, "")
        }
    }

    pub fn with_sender(mut self, sender_jid: impl Into<String>) -> Self {
        self.sender_jid = sender_jid.into();
        self
    }

    /// Whether the chat identifier carries the group-chat marker.
    pub fn is_group(&self) -> bool {
        self.chat_jid.ends_with(GROUP_SUFFIX)
    }
}

// ── Action result ───────────────────────────────────────────────────

/// Outcome of a rule action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    /// The action fully produced the response; evaluation stops here.
    pub handled: bool,
    /// Reply text to send back to the chat.
    #[serde(default)]
    pub reply: String,
    /// Extra data for logging or side effects.
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl ActionResult {
    /// A handled result carrying `reply`.
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            handled: true,
            reply: text.into(),
            meta: HashMap::new(),
        }
    }

    /// The "did not act" result.
    pub fn not_handled() -> Self {
        Self::default()
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

// ── Reply sink ──────────────────────────────────────────────────────

/// Reply dispatch collaborator: delivers handled results to the chat.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send_reply(&self, chat_jid: &str, result: &ActionResult) -> Result<(), PipelineError>;
}
