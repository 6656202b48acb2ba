//! Real-time message processing pipeline.
//!
//! Every inbound chat event flows through:
//! 1. `Aggregator` — debounces bursts per chat (sliding window)
//! 2. `RuleEngine::evaluate()` — priority rules pick at most one reply
//! 3. `ReplySink` — hands the reply back to the transport
//!
//! A misbehaving rule or webhook degrades to silence, never to a crash.

pub mod actions;
pub mod aggregator;
pub mod builtin;
pub mod predicates;
pub mod processor;
pub mod rules;
pub mod scheduler;
pub mod types;
pub mod webhook;
