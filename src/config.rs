use serde::Deserialize;
use std::sync::Arc;

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_MEDIA_MAX_BYTES: u64 = 80 * 1024 * 1024;
pub const DEFAULT_DEBOUNCE_MS: u64 = 1_000;
pub const DEFAULT_STREAM_PLACEHOLDER: &str = "1";

/// Environment variables that override the configured egress proxy.
pub const EGRESS_PROXY_ENV: &str = "EGRESS_PROXY_URL";
pub const EGRESS_PROXY_ENV_ALIAS: &str = "WECOM_BRIDGE_EGRESS_PROXY";

/// How markdown tables in agent output are rewritten before they reach the
/// WeCom stream, which renders markdown tables as raw pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableMode {
    /// Leave tables untouched.
    Keep,
    /// Wrap each table in a fenced code block so columns stay aligned.
    #[default]
    Fence,
    /// Flatten each data row into `【header】value` lines.
    Bullets,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    pub egress_proxy_url: Option<String>,
    pub http_timeout_secs: u64,
    pub media_max_bytes: u64,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            egress_proxy_url: None,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            media_max_bytes: DEFAULT_MEDIA_MAX_BYTES,
        }
    }
}

impl NetworkOptions {
    /// The effective egress proxy: env override first, config second.
    pub fn effective_proxy(&self) -> Option<String> {
        for key in [EGRESS_PROXY_ENV, EGRESS_PROXY_ENV_ALIAS] {
            if let Ok(value) = std::env::var(key) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
        self.egress_proxy_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
    }
}

/// Immutable per-account snapshot handed to the gateway by the embedding
/// application. Loading and validation of the raw config file happen there;
/// this crate only consumes ready values.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedAccount {
    /// Stable account name, used as the leading component of conversation keys.
    pub name: String,
    pub corp_id: String,
    /// WeCom agent id of the application ("应用"), as a string.
    pub agent_id: String,
    #[serde(default)]
    pub app_secret: String,
    /// Bot-channel callback token and EncodingAESKey.
    pub bot_token: String,
    pub bot_encoding_aes_key: String,
    /// Application-channel callback token and EncodingAESKey. Empty when the
    /// application channel is not set up; DM fallback is then unavailable.
    #[serde(default)]
    pub app_token: String,
    #[serde(default)]
    pub app_encoding_aes_key: String,
    /// Receiver id checked during decryption. WeCom uses the corp id for the
    /// application channel and an empty string for the bot channel.
    #[serde(default)]
    pub receiver_id: String,
    #[serde(default)]
    pub welcome_text: Option<String>,
    #[serde(default = "default_placeholder")]
    pub stream_placeholder: String,
    #[serde(default)]
    pub table_mode: TableMode,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default)]
    pub network: NetworkOptions,
}

fn default_placeholder() -> String {
    DEFAULT_STREAM_PLACEHOLDER.to_string()
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

impl ResolvedAccount {
    /// Whether the application channel is configured well enough to carry
    /// DM fallback traffic.
    pub fn application_configured(&self) -> bool {
        !self.app_secret.trim().is_empty() && !self.agent_id.trim().is_empty()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}
