//! Reusable rule actions.

use async_trait::async_trait;

use crate::error::ActionError;
use crate::pipeline::rules::Action;
use crate::pipeline::types::{ActionResult, Envelope};

/// Canned reply. Always handles the envelope.
#[derive(Debug, Clone)]
pub struct Reply {
    text: String,
}

impl Reply {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl Action for Reply {
    async fn execute(&self, _envelope: &Envelope) -> Result<ActionResult, ActionError> {
        Ok(ActionResult::reply(self.text.clone()))
    }
}
