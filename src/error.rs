//! Error types for chatflow.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Reply dispatch failed for {chat}: {reason}")]
    ReplySend { chat: String, reason: String },

    #[error("Invalid envelope: {0}")]
    Input(String),
}

/// Errors raised by rule actions.
///
/// The rule engine never surfaces these to its caller; a failed action
/// counts as "not handled".
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Action {name} failed: {reason}")]
    Failed { name: String, reason: String },
}

/// Outbound webhook failures.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("Request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("Webhook {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Malformed webhook response: {0}")]
    Decode(String),

    #[error("Webhook returned an empty reply")]
    EmptyReply,
}

/// Profile snapshot loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("No profile snapshot for {chat}")]
    NotFound { chat: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid profile snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for chatflow.
pub type Result<T> = std::result::Result<T, Error>;
