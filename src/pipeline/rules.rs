//! Priority rules engine.
//!
//! Matches an [`Envelope`] against ordered condition/action rules and
//! produces at most one response:
//! - rules run in descending priority, ties in insertion order
//! - every predicate of a rule must hold before its action runs
//! - the first action that reports `handled` wins
//! - a matching `stop_chain` rule that does not handle vetoes the rest
//!
//! Action errors never reach the caller; they count as "not handled".

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ActionError;
use crate::pipeline::types::{ActionResult, Envelope};

/// Condition over an envelope. Must be free of side effects.
pub trait Predicate: Send + Sync {
    fn matches(&self, envelope: &Envelope) -> bool;
}

/// Response producer run when all of a rule's predicates hold.
#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(&self, envelope: &Envelope) -> Result<ActionResult, ActionError>;
}

/// A named condition/action pair.
#[derive(Clone)]
pub struct Rule {
    pub name: String,
    /// All must hold (AND).
    pub when_all: Vec<Arc<dyn Predicate>>,
    pub then: Arc<dyn Action>,
    /// Higher runs first.
    pub priority: i32,
    /// Halt evaluation when this rule matches but does not handle.
    pub stop_chain: bool,
}

impl Rule {
    pub fn new(name: impl Into<String>, then: impl Action + 'static) -> Self {
        Self {
            name: name.into(),
            when_all: Vec::new(),
            then: Arc::new(then),
            priority: 0,
            stop_chain: false,
        }
    }

    /// Add a predicate.
    pub fn when(mut self, predicate: impl Predicate + 'static) -> Self {
        self.when_all.push(Arc::new(predicate));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn stop_chain(mut self) -> Self {
        self.stop_chain = true;
        self
    }

    fn matches(&self, envelope: &Envelope) -> bool {
        self.when_all.iter().all(|p| p.matches(envelope))
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("predicates", &self.when_all.len())
            .field("priority", &self.priority)
            .field("stop_chain", &self.stop_chain)
            .finish()
    }
}

/// Ordered rule set. Immutable once built; share it through `Arc`.
#[derive(Debug)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    /// Build an engine, ordering rules by descending priority.
    ///
    /// The sort is stable: equal priorities keep their input order.
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { rules }
    }

    /// Engine with no rules; every evaluation comes back not handled.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rule names in evaluation order.
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Evaluate an envelope against all rules.
    ///
    /// Returns the winning result and `true`, or a not-handled result and
    /// `false` when no rule both matched and handled it.
    pub async fn evaluate(&self, envelope: &Envelope) -> (ActionResult, bool) {
        for rule in &self.rules {
            if !rule.matches(envelope) {
                continue;
            }

            match rule.then.execute(envelope).await {
                Ok(result) if result.handled => {
                    debug!(
                        chat = %envelope.chat_jid,
                        rule = %rule.name,
                        priority = rule.priority,
                        "Rule handled envelope"
                    );
                    return (result, true);
                }
                Ok(_) => {
                    debug!(chat = %envelope.chat_jid, rule = %rule.name, "Rule matched but did not handle");
                }
                Err(e) => {
                    warn!(chat = %envelope.chat_jid, rule = %rule.name, error = %e, "Rule action failed");
                }
            }

            if rule.stop_chain {
                debug!(chat = %envelope.chat_jid, rule = %rule.name, "Stop-chain rule halted evaluation");
                return (ActionResult::not_handled(), false);
            }
        }

        (ActionResult::not_handled(), false)
    }
}
