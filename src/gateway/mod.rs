//! Webhook surface of the gateway: shared state, path registration and the
//! helpers both channel handlers use.

pub mod application;
pub mod bot;
pub mod crypto;
pub mod driver;
pub mod store;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::agent::AgentRuntime;
use crate::config::ResolvedAccount;
use crate::outbound::api::WeComApi;
use crate::outbound::token::TokenCache;
use crypto::EnvelopeCodec;
use driver::Driver;
use store::{GatewayStore, StreamState};

/// Inbound request bodies beyond this are rejected with 400.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// One configured account with its per-channel codecs.
pub struct AccountHandle {
    pub account: Arc<ResolvedAccount>,
    pub bot_codec: EnvelopeCodec,
    pub app_codec: Option<EnvelopeCodec>,
}

impl AccountHandle {
    pub fn new(account: Arc<ResolvedAccount>) -> Result<Self> {
        let bot_codec = EnvelopeCodec::new(&account.bot_token, &account.bot_encoding_aes_key, "")
            .with_context(|| format!("bot codec for account {}", account.name))?;
        let app_codec = if account.app_token.trim().is_empty() {
            None
        } else {
            Some(
                EnvelopeCodec::new(
                    &account.app_token,
                    &account.app_encoding_aes_key,
                    &account.receiver_id,
                )
                .with_context(|| format!("application codec for account {}", account.name))?,
            )
        };
        Ok(Self {
            account,
            bot_codec,
            app_codec,
        })
    }
}

/// Composition root: stores and clients are wired here once and handed to
/// handlers through axum state, so tests can build fresh instances.
#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<Vec<AccountHandle>>,
    pub store: Arc<GatewayStore>,
    pub api: Arc<WeComApi>,
    pub runtime: Arc<dyn AgentRuntime>,
    pub driver: Arc<Driver>,
}

impl AppState {
    pub fn new(accounts: Vec<ResolvedAccount>, runtime: Arc<dyn AgentRuntime>) -> Result<Self> {
        let handles = accounts
            .into_iter()
            .map(|account| AccountHandle::new(account.shared()))
            .collect::<Result<Vec<_>>>()?;
        let store = GatewayStore::new();
        let api = Arc::new(WeComApi::new(Arc::new(TokenCache::new(
            crate::outbound::api::API_BASE,
        ))));
        let driver = Driver::new(Arc::clone(&store), Arc::clone(&api), Arc::clone(&runtime));
        driver.install();
        Ok(Self {
            accounts: Arc::new(handles),
            store,
            api,
            runtime,
            driver,
        })
    }
}

/// Register the webhook paths under `base`: the bot channel at `/<base>` and
/// `/<base>/bot`, the application channel at `/<base>/agent`.
pub fn router(state: AppState, base: &str) -> Router {
    let base = base.trim_matches('/');
    Router::new()
        .route(
            &format!("/{base}"),
            get(bot::handle_verify).post(bot::handle_callback),
        )
        .route(
            &format!("/{base}/bot"),
            get(bot::handle_verify).post(bot::handle_callback),
        )
        .route(
            &format!("/{base}/agent"),
            get(application::handle_verify).post(application::handle_callback),
        )
        .with_state(state)
}

/// Callback query parameters. The signature arrives under one of three names
/// depending on the channel and platform version.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub msg_signature: Option<String>,
    #[serde(default)]
    pub msgsignature: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub echostr: Option<String>,
}

impl CallbackQuery {
    pub fn signature(&self) -> Option<&str> {
        self.msg_signature
            .as_deref()
            .or(self.msgsignature.as_deref())
            .or(self.signature.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn timestamp(&self) -> &str {
        self.timestamp.as_deref().map(str::trim).unwrap_or("")
    }

    pub fn nonce(&self) -> &str {
        self.nonce.as_deref().map(str::trim).unwrap_or("")
    }

    /// Reply timestamp: echo the inbound one, or mint a fresh epoch value.
    pub fn reply_timestamp(&self) -> String {
        let value = self.timestamp();
        if value.is_empty() {
            unix_timestamp_now().to_string()
        } else {
            value.to_string()
        }
    }

    pub fn reply_nonce(&self) -> String {
        let value = self.nonce();
        if value.is_empty() {
            random_ascii_token(12)
        } else {
            value.to_string()
        }
    }
}

pub fn unix_timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn random_ascii_token(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// The passive-stream frame for a reply slot. Images ride along only on the
/// finished frame, as `msg_item` entries.
pub(crate) fn stream_frame(state: &StreamState, include_images: bool) -> Value {
    let mut stream = serde_json::json!({
        "id": state.stream_id,
        "finish": state.finished,
        "content": state.content,
    });
    if include_images && state.finished && !state.images.is_empty() {
        let items: Vec<Value> = state
            .images
            .iter()
            .map(|image| {
                serde_json::json!({
                    "msgtype": "image",
                    "image": { "base64": image.base64, "md5": image.md5 },
                })
            })
            .collect();
        stream["msg_item"] = Value::Array(items);
    }
    serde_json::json!({ "msgtype": "stream", "stream": stream })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ChatKind;
    use std::collections::HashSet;
    use std::time::Instant;

    fn stream_state(finished: bool, images: usize) -> StreamState {
        StreamState {
            stream_id: "sid1".to_string(),
            msg_id: None,
            conversation_key: "ck".to_string(),
            batch_key: "ck".to_string(),
            user_id: "u1".to_string(),
            chat: ChatKind::Direct,
            chat_id: None,
            ai_agent_id: "bot1".to_string(),
            task_key: "bot1:ck".to_string(),
            created_at: Instant::now(),
            updated_at: Instant::now(),
            started: true,
            finished,
            error: false,
            content: "hello".to_string(),
            images: (0..images)
                .map(|i| store::StreamImage {
                    base64: format!("img{i}"),
                    md5: format!("md5{i}"),
                })
                .collect(),
            dm_content: String::new(),
            agent_media_keys: HashSet::new(),
            fallback: store::FallbackMode::None,
            fallback_prompt_sent_at: None,
            final_delivered_at: None,
        }
    }

    #[test]
    fn signature_param_aliases() {
        let mut query = CallbackQuery::default();
        assert!(query.signature().is_none());
        query.signature = Some("s3".to_string());
        assert_eq!(query.signature(), Some("s3"));
        query.msgsignature = Some("s2".to_string());
        assert_eq!(query.signature(), Some("s2"));
        query.msg_signature = Some(" s1 ".to_string());
        assert_eq!(query.signature(), Some("s1"));
    }

    #[test]
    fn reply_timestamp_and_nonce_fall_back_when_missing() {
        let query = CallbackQuery::default();
        assert!(!query.reply_timestamp().is_empty());
        assert_eq!(query.reply_nonce().len(), 12);

        let query = CallbackQuery {
            timestamp: Some("1700000000".to_string()),
            nonce: Some("n1".to_string()),
            ..CallbackQuery::default()
        };
        assert_eq!(query.reply_timestamp(), "1700000000");
        assert_eq!(query.reply_nonce(), "n1");
    }

    #[test]
    fn stream_frame_images_only_on_finish() {
        let frame = stream_frame(&stream_state(false, 2), true);
        assert!(frame["stream"]["msg_item"].is_null());

        let frame = stream_frame(&stream_state(true, 2), true);
        assert_eq!(frame["stream"]["msg_item"].as_array().unwrap().len(), 2);
        assert_eq!(frame["msgtype"], "stream");
        assert_eq!(frame["stream"]["finish"], true);

        let frame = stream_frame(&stream_state(true, 2), false);
        assert!(frame["stream"]["msg_item"].is_null());
    }
}
