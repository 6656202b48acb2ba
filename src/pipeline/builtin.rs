//! Default rule set.

use std::sync::Arc;

use regex::Regex;

use crate::pipeline::actions::Reply;
use crate::pipeline::predicates::{Command, OnGroup, Pattern};
use crate::pipeline::rules::Rule;
use crate::pipeline::webhook::{ProfileAllowsWebhook, ProfileStore, SendToWebhook, WebhookConfig};

/// Reply to `/help`.
pub const HELP_TEXT: &str = "Commands: /help, /ping, /demo";

/// Reply to `/demo` in a group.
pub const GROUP_DEMO_TEXT: &str = "Group demo 👥";

/// Reply when a message contains an e-mail address.
pub const EMAIL_ACK_TEXT: &str = "Got your e-mail address, thanks!";

const EMAIL_PATTERN: &str = r"(?i)\b[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}\b";

/// Builtin rules, webhook forwarding first.
pub fn builtin_rules(webhook: Arc<WebhookConfig>, profiles: Arc<dyn ProfileStore>) -> Vec<Rule> {
    vec![
        Rule::new(
            "profile→webhook",
            SendToWebhook::new(webhook, Arc::clone(&profiles)),
        )
        .when(ProfileAllowsWebhook::new(profiles))
        .priority(1000),
        Rule::new("help", Reply::new(HELP_TEXT))
            .when(Command::new("help"))
            .priority(100),
        Rule::new("ping", Reply::new("pong"))
            .when(Command::new("ping"))
            .priority(90),
        Rule::new("demo group", Reply::new(GROUP_DEMO_TEXT))
            .when(OnGroup)
            .when(Command::new("demo"))
            .priority(70),
        Rule::new("email detector", Reply::new(EMAIL_ACK_TEXT))
            .when(Pattern::from_regex(Regex::new(EMAIL_PATTERN).unwrap()))
            .priority(60),
    ]
}
