//! Profile-gated webhook forwarding.
//!
//! The only rule action that touches the network. A chat is forwarded only
//! when its profile snapshot exists and carries no block flag; the endpoint
//! is picked by tier, then language, then the default. Every failure turns
//! into "not handled" so lower-priority rules get their turn.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::config::parse_millis;
use crate::error::{ActionError, ProfileError, WebhookError};
use crate::pipeline::rules::{Action, Predicate};
use crate::pipeline::types::{ActionResult, Envelope};

/// Default outbound timeout.
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default directory of profile snapshots.
pub const DEFAULT_PROFILES_DIR: &str = "outbox/profiles";

// ── Profile snapshot ────────────────────────────────────────────────

/// Per-contact profile, maintained by another component and read here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSnapshot {
    pub sender_jid: String,
    pub lang: String,
    pub tier: String,
    #[serde(deserialize_with = "null_as_default")]
    pub tags: HashMap<String, String>,
    #[serde(deserialize_with = "null_as_default")]
    pub media: ProfileMedia,
    #[serde(deserialize_with = "null_as_default")]
    pub block: ProfileBlock,
}

/// Recent media seen in each direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileMedia {
    #[serde(rename = "in", deserialize_with = "null_as_default")]
    pub inbound: Vec<MediaEntry>,
    #[serde(rename = "out", deserialize_with = "null_as_default")]
    pub outbound: Vec<MediaEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaEntry {
    pub direction: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub mimetype: String,
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileBlock {
    pub spam: bool,
    pub malicious: bool,
    pub permanent: bool,
    pub until: Option<DateTime<Utc>>,
}

/// Snapshot writers emit empty maps and lists as `null`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ProfileSnapshot {
    /// Any block flag set.
    pub fn is_blocked(&self) -> bool {
        self.block.spam || self.block.malicious || self.block.permanent
    }
}

/// Source of profile snapshots.
pub trait ProfileStore: Send + Sync {
    fn load(&self, chat_jid: &str) -> Result<ProfileSnapshot, ProfileError>;
}

/// Reads `<root>/<sanitized chat id>.json`.
#[derive(Debug, Clone)]
pub struct FileProfileStore {
    root: PathBuf,
}

impl FileProfileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, chat_jid: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_path_part(chat_jid)))
    }
}

impl ProfileStore for FileProfileStore {
    fn load(&self, chat_jid: &str) -> Result<ProfileSnapshot, ProfileError> {
        let bytes = std::fs::read(self.path_for(chat_jid)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProfileError::NotFound {
                    chat: chat_jid.to_string(),
                }
            } else {
                ProfileError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Map a chat id to a safe file stem.
///
/// Keeps `[A-Za-z0-9._-]`, replaces everything else with `_`; blank input
/// becomes `unknown`.
pub fn sanitize_path_part(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

// ── Config ──────────────────────────────────────────────────────────

/// Webhook endpoints and transport settings.
#[derive(Debug)]
pub struct WebhookConfig {
    /// Fallback endpoint (`N8N_WEBHOOK_URL`).
    pub default_url: Option<String>,
    /// Upper-cased tier → endpoint (`N8N_<TIER>_WEBHOOK_URL`).
    pub tier_urls: HashMap<String, String>,
    /// Upper-cased language → endpoint (`N8N_LANG_<LANG>_WEBHOOK_URL`).
    pub lang_urls: HashMap<String, String>,
    /// Outbound request timeout (`N8N_TIMEOUT_MS`).
    pub timeout: Duration,
    /// Bearer token (`N8N_AUTH_TOKEN`).
    pub auth_token: Option<SecretString>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            default_url: None,
            tier_urls: HashMap::new(),
            lang_urls: HashMap::new(),
            timeout: DEFAULT_WEBHOOK_TIMEOUT,
            auth_token: None,
        }
    }
}

impl WebhookConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Load from `(key, value)` pairs shaped like environment variables.
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();

        for (key, value) in vars {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }

            match key.as_str() {
                "N8N_WEBHOOK_URL" => config.default_url = Some(value.to_string()),
                "N8N_TIMEOUT_MS" => {
                    config.timeout = parse_millis(&key, value, DEFAULT_WEBHOOK_TIMEOUT);
                }
                "N8N_AUTH_TOKEN" => config.auth_token = Some(SecretString::from(value.to_string())),
                _ => {
                    let Some(middle) = key
                        .strip_prefix("N8N_")
                        .and_then(|k| k.strip_suffix("_WEBHOOK_URL"))
                    else {
                        continue;
                    };
                    if let Some(lang) = middle.strip_prefix("LANG_") {
                        if !lang.is_empty() {
                            config.lang_urls.insert(lang.to_uppercase(), value.to_string());
                        }
                    } else if !middle.is_empty() {
                        config.tier_urls.insert(middle.to_uppercase(), value.to_string());
                    }
                }
            }
        }

        config
    }

    pub fn with_default_url(mut self, url: impl Into<String>) -> Self {
        self.default_url = Some(url.into());
        self
    }

    pub fn with_tier_url(mut self, tier: &str, url: impl Into<String>) -> Self {
        self.tier_urls.insert(tier.to_uppercase(), url.into());
        self
    }

    pub fn with_lang_url(mut self, lang: &str, url: impl Into<String>) -> Self {
        self.lang_urls.insert(lang.to_uppercase(), url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(SecretString::from(token.into()));
        self
    }

    /// Endpoint for `profile`: tier, then language, then default.
    pub fn resolve(&self, profile: &ProfileSnapshot) -> Option<&str> {
        fn lookup<'a>(urls: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            urls.get(&key.to_uppercase()).map(String::as_str)
        }

        lookup(&self.tier_urls, &profile.tier)
            .or_else(|| lookup(&self.lang_urls, &profile.lang))
            .or(self.default_url.as_deref())
    }
}

// ── Predicate + action ──────────────────────────────────────────────

fn allowed_profile(profiles: &dyn ProfileStore, chat_jid: &str) -> Option<ProfileSnapshot> {
    match profiles.load(chat_jid) {
        Ok(profile) if profile.is_blocked() => {
            debug!(chat = %chat_jid, "Profile is blocked, not forwarding");
            None
        }
        Ok(profile) => Some(profile),
        Err(e) => {
            debug!(chat = %chat_jid, error = %e, "No usable profile snapshot");
            None
        }
    }
}

/// Holds when the chat's profile exists and is not blocked.
#[derive(Clone)]
pub struct ProfileAllowsWebhook {
    profiles: Arc<dyn ProfileStore>,
}

impl ProfileAllowsWebhook {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        Self { profiles }
    }
}

impl Predicate for ProfileAllowsWebhook {
    fn matches(&self, envelope: &Envelope) -> bool {
        allowed_profile(self.profiles.as_ref(), &envelope.chat_jid).is_some()
    }
}

#[derive(Serialize)]
struct WebhookRequest<'a> {
    chat_jid: &'a str,
    /// Latest text of the batch.
    aggregated: &'a str,
    profile: &'a ProfileSnapshot,
}

#[derive(Deserialize)]
struct WebhookResponse {
    #[serde(default)]
    reply: String,
}

/// Forwards the envelope to the profile's webhook and relays its reply.
#[derive(Clone)]
pub struct SendToWebhook {
    config: Arc<WebhookConfig>,
    profiles: Arc<dyn ProfileStore>,
    client: reqwest::Client,
}

impl SendToWebhook {
    pub fn new(config: Arc<WebhookConfig>, profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            config,
            profiles,
            client: reqwest::Client::new(),
        }
    }

    /// Gate check on the blocking pool; store reads are file I/O.
    async fn load_allowed(&self, chat_jid: &str) -> Option<ProfileSnapshot> {
        let profiles = Arc::clone(&self.profiles);
        let chat = chat_jid.to_string();
        match tokio::task::spawn_blocking(move || allowed_profile(profiles.as_ref(), &chat)).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(chat = %chat_jid, error = %e, "Profile load task failed");
                None
            }
        }
    }

    async fn forward(
        &self,
        url: &str,
        envelope: &Envelope,
        profile: &ProfileSnapshot,
    ) -> Result<String, WebhookError> {
        let body = WebhookRequest {
            chat_jid: &envelope.chat_jid,
            aggregated: envelope.text.trim(),
            profile,
        };

        let mut request = self
            .client
            .post(url)
            .timeout(self.config.timeout)
            .json(&body);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|e| self.request_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let parsed: WebhookResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.request_error(url, e)
            } else {
                WebhookError::Decode(e.to_string())
            }
        })?;

        let reply = parsed.reply.trim();
        if reply.is_empty() {
            return Err(WebhookError::EmptyReply);
        }
        Ok(reply.to_string())
    }

    fn request_error(&self, url: &str, e: reqwest::Error) -> WebhookError {
        if e.is_timeout() {
            WebhookError::Timeout {
                url: url.to_string(),
                timeout: self.config.timeout,
            }
        } else {
            WebhookError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl Action for SendToWebhook {
    async fn execute(&self, envelope: &Envelope) -> Result<ActionResult, ActionError> {
        // Re-checked here: the action may be used without the gate predicate.
        let Some(profile) = self.load_allowed(&envelope.chat_jid).await else {
            return Ok(ActionResult::not_handled());
        };

        let Some(url) = self.config.resolve(&profile) else {
            debug!(chat = %envelope.chat_jid, tier = %profile.tier, lang = %profile.lang, "No webhook endpoint configured");
            return Ok(ActionResult::not_handled());
        };

        match self.forward(url, envelope, &profile).await {
            Ok(reply) => {
                debug!(chat = %envelope.chat_jid, url = %url, "Webhook replied");
                Ok(ActionResult::reply(reply).with_meta("webhook", url))
            }
            Err(e) => {
                warn!(chat = %envelope.chat_jid, url = %url, error = %e, "Webhook forward failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory profile store.
    #[derive(Default)]
    struct MapStore(HashMap<String, ProfileSnapshot>);

    impl ProfileStore for MapStore {
        fn load(&self, chat_jid: &str) -> Result<ProfileSnapshot, ProfileError> {
            self.0.get(chat_jid).cloned().ok_or_else(|| ProfileError::NotFound {
                chat: chat_jid.to_string(),
            })
        }
    }

    fn store_with(chat: &str, profile: ProfileSnapshot) -> Arc<dyn ProfileStore> {
        let mut map = HashMap::new();
        map.insert(chat.to_string(), profile);
        Arc::new(MapStore(map))
    }

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn sanitizes_chat_ids() {
        assert_eq!(sanitize_path_part("34600@s.whatsapp.net"), "34600_s.whatsapp.net");
        assert_eq!(sanitize_path_part("  a/b\\c  "), "a_b_c");
        assert_eq!(sanitize_path_part(""), "unknown");
        assert_eq!(sanitize_path_part("   "), "unknown");
    }

    #[test]
    fn file_store_reads_sanitized_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProfileStore::new(dir.path());
        std::fs::write(
            store.path_for("123@s.whatsapp.net"),
            r#"{"sender_jid":"123@s.whatsapp.net","lang":"es","tier":"gold",
                "tags":{"source":"ads"},
                "media":{"in":[{"direction":"in","type":"image","mimetype":"image/jpeg","at":"2024-05-01T10:00:00Z"}],"out":[]},
                "block":{"spam":false,"malicious":false,"permanent":false,"until":"0001-01-01T00:00:00Z"}}"#,
        )
        .unwrap();

        assert!(dir.path().join("123_s.whatsapp.net.json").exists());
        let profile = store.load("123@s.whatsapp.net").unwrap();
        assert_eq!(profile.tier, "gold");
        assert_eq!(profile.tags.get("source").map(String::as_str), Some("ads"));
        assert_eq!(profile.media.inbound.len(), 1);
        assert_eq!(profile.media.inbound[0].kind, "image");
        assert!(!profile.is_blocked());
    }

    #[test]
    fn file_store_accepts_null_collections() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProfileStore::new(dir.path());
        std::fs::write(
            store.path_for("555@s.whatsapp.net"),
            r#"{"sender_jid":"555@s.whatsapp.net","lang":"es","tier":"gold","tags":null,
                "media":{"in":null,"out":null},
                "block":{"spam":false,"malicious":false,"permanent":false,"until":"0001-01-01T00:00:00Z"}}"#,
        )
        .unwrap();

        let profile = store.load("555@s.whatsapp.net").unwrap();
        assert!(profile.tags.is_empty());
        assert!(profile.media.inbound.is_empty());
        assert!(profile.media.outbound.is_empty());
        assert_eq!(profile.tier, "gold");

        let gate = ProfileAllowsWebhook::new(Arc::new(store));
        assert!(gate.matches(&Envelope::message("555@s.whatsapp.net", "hola")));
    }

    #[test]
    fn null_media_and_block_decode_as_defaults() {
        let profile: ProfileSnapshot =
            serde_json::from_str(r#"{"tier":"silver","media":null,"block":null}"#).unwrap();
        assert_eq!(profile.media, ProfileMedia::default());
        assert!(!profile.is_blocked());
    }

    #[test]
    fn file_store_missing_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileProfileStore::new(dir.path());
        assert!(matches!(store.load("nobody"), Err(ProfileError::NotFound { .. })));

        std::fs::write(store.path_for("broken"), "not json").unwrap();
        assert!(matches!(store.load("broken"), Err(ProfileError::Json(_))));
    }

    #[test]
    fn profile_decodes_with_missing_fields() {
        let profile: ProfileSnapshot = serde_json::from_str(r#"{"block":{"spam":true}}"#).unwrap();
        assert!(profile.is_blocked());
        assert!(profile.tier.is_empty());
        assert!(profile.block.until.is_none());
    }

    #[test]
    fn config_from_vars() {
        let config = WebhookConfig::from_vars(vars(&[
            ("N8N_WEBHOOK_URL", " http://default "),
            ("N8N_GOLD_WEBHOOK_URL", "http://gold"),
            ("N8N_LANG_ES_WEBHOOK_URL", "http://es"),
            ("N8N_TIMEOUT_MS", "1500"),
            ("N8N_AUTH_TOKEN", "s3cret"),
            ("N8N_SILVER_WEBHOOK_URL", "   "),
            ("UNRELATED", "x"),
        ]));

        assert_eq!(config.default_url.as_deref(), Some("http://default"));
        assert_eq!(config.tier_urls.get("GOLD").map(String::as_str), Some("http://gold"));
        assert!(!config.tier_urls.contains_key("SILVER"));
        assert_eq!(config.lang_urls.get("ES").map(String::as_str), Some("http://es"));
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.auth_token.as_ref().map(|t| t.expose_secret()), Some("s3cret"));
    }

    #[test]
    fn config_invalid_timeout_keeps_default() {
        let config = WebhookConfig::from_vars(vars(&[("N8N_TIMEOUT_MS", "soon")]));
        assert_eq!(config.timeout, DEFAULT_WEBHOOK_TIMEOUT);
        let config = WebhookConfig::from_vars(vars(&[("N8N_TIMEOUT_MS", "0")]));
        assert_eq!(config.timeout, DEFAULT_WEBHOOK_TIMEOUT);
    }

    #[test]
    fn resolve_prefers_tier_then_lang_then_default() {
        let config = WebhookConfig::default()
            .with_default_url("http://default")
            .with_tier_url("gold", "http://gold")
            .with_lang_url("es", "http://es");

        let gold_es = ProfileSnapshot {
            tier: "Gold".into(),
            lang: "es".into(),
            ..Default::default()
        };
        assert_eq!(config.resolve(&gold_es), Some("http://gold"));

        let silver_es = ProfileSnapshot {
            tier: "silver".into(),
            lang: "ES".into(),
            ..Default::default()
        };
        assert_eq!(config.resolve(&silver_es), Some("http://es"));

        let nobody = ProfileSnapshot::default();
        assert_eq!(config.resolve(&nobody), Some("http://default"));

        assert_eq!(WebhookConfig::default().resolve(&nobody), None);
    }

    #[test]
    fn gate_requires_unblocked_profile() {
        let ok = ProfileAllowsWebhook::new(store_with("c1", ProfileSnapshot::default()));
        assert!(ok.matches(&Envelope::message("c1", "hi")));
        assert!(!ok.matches(&Envelope::message("c2", "hi")));

        for flag in ["spam", "malicious", "permanent"] {
            let mut profile = ProfileSnapshot::default();
            match flag {
                "spam" => profile.block.spam = true,
                "malicious" => profile.block.malicious = true,
                _ => profile.block.permanent = true,
            }
            let gate = ProfileAllowsWebhook::new(store_with("c1", profile));
            assert!(!gate.matches(&Envelope::message("c1", "hi")), "{flag} should block");
        }
    }

    #[tokio::test]
    async fn spam_profile_is_never_forwarded() {
        let mut profile = ProfileSnapshot {
            tier: "gold".into(),
            ..Default::default()
        };
        profile.block.spam = true;

        // Endpoints configured at every level; none may be contacted.
        let config = WebhookConfig::default()
            .with_default_url("http://127.0.0.1:9/default")
            .with_tier_url("gold", "http://127.0.0.1:9/gold");
        let action = SendToWebhook::new(Arc::new(config), store_with("c1", profile));

        let result = action.execute(&Envelope::message("c1", "hola")).await.unwrap();
        assert!(!result.handled);
    }

    /// Records which thread each load ran on.
    struct ThreadRecorder {
        threads: std::sync::Mutex<Vec<std::thread::ThreadId>>,
    }

    impl ProfileStore for ThreadRecorder {
        fn load(&self, _chat_jid: &str) -> Result<ProfileSnapshot, ProfileError> {
            self.threads.lock().unwrap().push(std::thread::current().id());
            Ok(ProfileSnapshot::default())
        }
    }

    #[tokio::test]
    async fn action_loads_profile_off_the_runtime_thread() {
        let store = Arc::new(ThreadRecorder {
            threads: std::sync::Mutex::new(Vec::new()),
        });
        // No endpoint: the action stops right after the profile check.
        let action = SendToWebhook::new(
            Arc::new(WebhookConfig::default()),
            Arc::clone(&store) as Arc<dyn ProfileStore>,
        );

        let result = action.execute(&Envelope::message("c1", "hola")).await.unwrap();
        assert!(!result.handled);

        let threads = store.threads.lock().unwrap();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
    }

    #[tokio::test]
    async fn missing_profile_or_endpoint_is_not_handled() {
        let action = SendToWebhook::new(
            Arc::new(WebhookConfig::default().with_default_url("http://127.0.0.1:9")),
            Arc::new(MapStore::default()),
        );
        let result = action.execute(&Envelope::message("c1", "hola")).await.unwrap();
        assert!(!result.handled);

        let action = SendToWebhook::new(
            Arc::new(WebhookConfig::default()),
            store_with("c1", ProfileSnapshot::default()),
        );
        let result = action.execute(&Envelope::message("c1", "hola")).await.unwrap();
        assert!(!result.handled);
    }
}
