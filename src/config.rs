//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::error::ConfigError;
use crate::pipeline::webhook::{DEFAULT_PROFILES_DIR, WebhookConfig};

/// Default aggregation window.
pub const DEFAULT_AGGREGATOR_WINDOW: Duration = Duration::from_secs(2);

/// Pipeline configuration.
#[derive(Debug)]
pub struct AppConfig {
    /// Inactivity before a chat's batch closes (`WH_AGGREGATOR_WINDOW_MS`,
    /// or a duration string such as `1500ms` in `WH_AGGREGATOR_WINDOW`).
    pub aggregator_window: Duration,
    /// Directory of profile snapshots (`WH_PROFILES_DIR`).
    pub profiles_dir: PathBuf,
    /// Outbound webhook settings (`N8N_*`).
    pub webhook: WebhookConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            aggregator_window: DEFAULT_AGGREGATOR_WINDOW,
            profiles_dir: PathBuf::from(DEFAULT_PROFILES_DIR),
            webhook: WebhookConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        let aggregator_window = window_from(
            std::env::var("WH_AGGREGATOR_WINDOW_MS").ok().as_deref(),
            std::env::var("WH_AGGREGATOR_WINDOW").ok().as_deref(),
        );

        let profiles_dir = std::env::var("WH_PROFILES_DIR")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROFILES_DIR));

        Self {
            aggregator_window,
            profiles_dir,
            webhook: WebhookConfig::from_env(),
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregator_window.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "WH_AGGREGATOR_WINDOW_MS".into(),
                message: "window must be greater than zero".into(),
            });
        }
        if self.webhook.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "N8N_TIMEOUT_MS".into(),
                message: "timeout must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Window from the millisecond key, else the duration-string key.
fn window_from(millis: Option<&str>, duration: Option<&str>) -> Duration {
    if let Some(raw) = millis.filter(|s| !s.trim().is_empty()) {
        return parse_millis("WH_AGGREGATOR_WINDOW_MS", raw, DEFAULT_AGGREGATOR_WINDOW);
    }
    match duration.filter(|s| !s.trim().is_empty()) {
        Some(raw) => match parse_duration(raw) {
            Some(window) if !window.is_zero() => window,
            _ => {
                tracing::warn!(
                    key = "WH_AGGREGATOR_WINDOW",
                    value = raw,
                    default_ms = DEFAULT_AGGREGATOR_WINDOW.as_millis() as u64,
                    "Invalid duration, using default"
                );
                DEFAULT_AGGREGATOR_WINDOW
            }
        },
        None => DEFAULT_AGGREGATOR_WINDOW,
    }
}

/// Parse a duration string like `2s`, `1500ms` or `1m30s`.
///
/// Units: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`; fractions are allowed
/// (`1.5s`). A bare `0` is zero. Signs are rejected.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw == "0" {
        return Some(Duration::ZERO);
    }

    let part = Regex::new(r"(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|μs|ms|s|m|h)").unwrap();
    let mut end = 0;
    let mut nanos = 0f64;
    for caps in part.captures_iter(raw) {
        let whole = caps.get(0)?;
        if whole.start() != end {
            return None;
        }
        end = whole.end();

        let value: f64 = caps[1].parse().ok()?;
        let scale = match &caps[2] {
            "ns" => 1e0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            _ => 3600e9,
        };
        nanos += value * scale;
    }

    if end == 0 || end != raw.len() {
        return None;
    }
    Some(Duration::from_nanos(nanos.round() as u64))
}

/// Parse a positive millisecond count, keeping `default` on bad input.
pub(crate) fn parse_millis(key: &str, raw: &str, default: Duration) -> Duration {
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Duration::from_millis(ms),
        _ => {
            tracing::warn!(key, value = raw, default_ms = default.as_millis() as u64, "Invalid duration, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_millis_accepts_positive_numbers() {
        assert_eq!(
            parse_millis("K", " 250 ", Duration::from_secs(1)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn parse_millis_falls_back() {
        let default = Duration::from_secs(2);
        assert_eq!(parse_millis("K", "0", default), default);
        assert_eq!(parse_millis("K", "-5", default), default);
        assert_eq!(parse_millis("K", "2s", default), default);
        assert_eq!(parse_millis("K", "", default), default);
    }

    #[test]
    fn parse_duration_strings() {
        assert_eq!(parse_duration("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration(" 1500ms "), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("250us"), Some(Duration::from_micros(250)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        for raw in ["", "2", "2 s", "-2s", "s", "2x", "2s!", "abc"] {
            assert_eq!(parse_duration(raw), None, "{raw:?}");
        }
    }

    #[test]
    fn window_prefers_millis_then_duration_string() {
        assert_eq!(window_from(None, None), DEFAULT_AGGREGATOR_WINDOW);
        assert_eq!(window_from(None, Some("3s")), Duration::from_secs(3));
        assert_eq!(window_from(Some("750"), Some("3s")), Duration::from_millis(750));
        assert_eq!(window_from(Some("  "), Some("500ms")), Duration::from_millis(500));
    }

    #[test]
    fn bad_window_string_keeps_default() {
        assert_eq!(window_from(None, Some("soon")), DEFAULT_AGGREGATOR_WINDOW);
        assert_eq!(window_from(None, Some("0s")), DEFAULT_AGGREGATOR_WINDOW);
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert_eq!(config.aggregator_window, Duration::from_secs(2));
        assert_eq!(config.profiles_dir, PathBuf::from("outbox/profiles"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_window_is_rejected() {
        let config = AppConfig {
            aggregator_window: Duration::ZERO,
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "WH_AGGREGATOR_WINDOW_MS"
        ));
    }
}
