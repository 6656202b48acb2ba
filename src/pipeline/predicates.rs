//! Reusable rule predicates.

use regex::Regex;

use crate::pipeline::rules::Predicate;
use crate::pipeline::types::Envelope;

/// Slash command match: `/name` alone or followed by a space.
///
/// Case-insensitive, ignores surrounding whitespace. `/helpme` does not
/// match `help`.
#[derive(Debug, Clone)]
pub struct Command {
    prefix: String,
}

impl Command {
    /// `name` may be given with or without its leading slash.
    pub fn new(name: &str) -> Self {
        let name = name.trim().trim_start_matches('/').to_lowercase();
        Self {
            prefix: format!("/{name}"),
        }
    }
}

impl Predicate for Command {
    fn matches(&self, envelope: &Envelope) -> bool {
        let text = envelope.text.trim().to_lowercase();
        match text.strip_prefix(&self.prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with(' '),
            None => false,
        }
    }
}

/// Case-insensitive substring match.
#[derive(Debug, Clone)]
pub struct Contains {
    needle: String,
}

impl Contains {
    pub fn new(needle: &str) -> Self {
        Self {
            needle: needle.to_lowercase(),
        }
    }
}

impl Predicate for Contains {
    fn matches(&self, envelope: &Envelope) -> bool {
        envelope.text.to_lowercase().contains(&self.needle)
    }
}

/// Regex match against the message text.
#[derive(Debug, Clone)]
pub struct Pattern {
    regex: Regex,
}

impl Pattern {
    /// Compile `pattern`. Use an inline `(?i)` flag for case-insensitive matching.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    pub fn from_regex(regex: Regex) -> Self {
        Self { regex }
    }
}

impl Predicate for Pattern {
    fn matches(&self, envelope: &Envelope) -> bool {
        self.regex.is_match(&envelope.text)
    }
}

/// Direct (one-to-one) chats only.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnDm;

impl Predicate for OnDm {
    fn matches(&self, envelope: &Envelope) -> bool {
        !envelope.is_group()
    }
}

/// Group chats only.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnGroup;

impl Predicate for OnGroup {
    fn matches(&self, envelope: &Envelope) -> bool {
        envelope.is_group()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(chat: &str, text: &str) -> Envelope {
        Envelope::message(chat, text)
    }

    #[test]
    fn command_exact_and_with_args() {
        let help = Command::new("help");
        assert!(help.matches(&env("c", "/help")));
        assert!(help.matches(&env("c", "  /HELP  ")));
        assert!(help.matches(&env("c", "/help me please")));
    }

    #[test]
    fn command_rejects_partial_words() {
        let help = Command::new("help");
        assert!(!help.matches(&env("c", "/helpme")));
        assert!(!help.matches(&env("c", "help")));
        assert!(!help.matches(&env("c", "please /help")));
        assert!(!help.matches(&env("c", "")));
    }

    #[test]
    fn command_tolerates_leading_slash_in_name() {
        let ping = Command::new("/Ping");
        assert!(ping.matches(&env("c", "/ping")));
    }

    #[test]
    fn contains_is_case_insensitive() {
        let p = Contains::new("Precio");
        assert!(p.matches(&env("c", "¿cuál es el PRECIO?")));
        assert!(!p.matches(&env("c", "hola")));
    }

    #[test]
    fn pattern_matches_text() {
        let p = Pattern::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").unwrap();
        assert!(p.matches(&env("c", "write me at Ana@Example.com")));
        assert!(!p.matches(&env("c", "no address here")));
    }

    #[test]
    fn pattern_rejects_invalid_regex() {
        assert!(Pattern::new("(unclosed").is_err());
    }

    #[test]
    fn dm_and_group_partition_chats() {
        let dm = env("34600111222@s.whatsapp.net", "hi");
        let group = env("120363025@g.us", "hi");
        assert!(OnDm.matches(&dm));
        assert!(!OnGroup.matches(&dm));
        assert!(OnGroup.matches(&group));
        assert!(!OnDm.matches(&group));
    }
}
