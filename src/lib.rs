//! chatflow — debounce and rule-dispatch core for chat automation.

pub mod config;
pub mod error;
pub mod pipeline;
