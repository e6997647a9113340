use anyhow::{Context, Result};
use base64::Engine as _;
use md5 as md5_crate;
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::agent::{AgentBlock, AgentRuntime, ChatKind, CommandVerdict, InboundContext, SavedMedia};
use crate::config::{ResolvedAccount, TableMode};
use crate::gateway::crypto::EnvelopeCodec;
use crate::gateway::store::{
    FallbackMode, GatewayStore, PendingBatch, StreamImage, STREAM_MAX_BYTES,
};
use crate::gateway::stream_frame;
use crate::outbound::api::WeComApi;
use crate::outbound::http;
use crate::outbound::target::SendTarget;

/// The platform stops polling a bot stream six minutes after it opens; we
/// fail over slightly before that edge.
const BOT_STREAM_WINDOW: Duration = Duration::from_secs(360);
const BOT_WINDOW_MARGIN: Duration = Duration::from_secs(30);

const PROMPT_CARD_SENT: &str = "[已发送交互卡片]";
const PROMPT_FILE_DM: &str = "文件将通过应用私信发送，请查收。";
const PROMPT_TIMEOUT_DM: &str = "本次回复耗时较长，剩余内容将通过应用私信继续发送。";
const PROMPT_TIMEOUT_NO_APP: &str =
    "本次回复耗时较长，且应用私信通道未配置，超出部分无法继续发送。请管理员补全应用配置。";
const PROMPT_APP_UNCONFIGURED: &str =
    "应用私信通道未配置，无法发送文件。请管理员在账号配置中补全应用 Secret 后重试。";
const PROMPT_UNAUTHORIZED: &str =
    "该指令未被授权执行。请联系管理员调整私信指令策略，或将你加入指令白名单后重试。";
const PROMPT_MERGED_DONE: &str = "已合并处理完成，请查看上一条回复。";
const PROMPT_RESET_ACK: &str = "会话已重置，我们重新开始吧。";
const PROMPT_NEW_SESSION_ACK: &str = "已开启新会话。";
const PROMPT_IMAGES_SENT: &str = "已发送图片，请查收。";
const PROMPT_MEDIA_TOO_LARGE: &str = "附件超出大小限制，请调高 media.max_bytes 后重试。";

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Consumes flushed batches: resolves the route, authorizes commands, drives
/// the agent and folds its block stream back into the reply slot, failing
/// over to application DMs when the bot stream cannot carry the answer.
pub struct Driver {
    store: Arc<GatewayStore>,
    api: Arc<WeComApi>,
    runtime: Arc<dyn AgentRuntime>,
}

struct BlockCtx {
    stream_id: String,
    account: Arc<ResolvedAccount>,
    user_id: String,
    raw_body: String,
    is_group: bool,
    is_reset_command: bool,
}

impl Driver {
    pub fn new(
        store: Arc<GatewayStore>,
        api: Arc<WeComApi>,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            api,
            runtime,
        })
    }

    /// Wire this driver in as the store's flush handler.
    pub fn install(self: &Arc<Self>) {
        let driver = Arc::clone(self);
        self.store.set_flush_handler(Arc::new(move |batch: PendingBatch| {
            let driver = Arc::clone(&driver);
            tokio::spawn(async move {
                driver.process_batch(batch).await;
            });
        }));
    }

    pub async fn process_batch(&self, batch: PendingBatch) {
        let stream_id = batch.stream_id.clone();
        let account = Arc::clone(&batch.origin.account);
        self.store.mark_started(&stream_id);

        let raw_body = batch.contents.join("\n");
        let command_body = parse_command_body(&raw_body);
        let bctx = BlockCtx {
            stream_id: stream_id.clone(),
            account: Arc::clone(&account),
            user_id: batch.origin.user_id.clone(),
            raw_body: raw_body.clone(),
            is_group: batch.origin.chat.is_group(),
            is_reset_command: is_reset_command(command_body.as_deref()),
        };

        // A bare "send this local file" request skips the agent entirely.
        if let Some(paths) = local_send_intent(&raw_body) {
            self.handle_send_intent(&bctx, &paths).await;
            self.finalize(&batch, &bctx).await;
            return;
        }

        let media = match self.materialize_inbound_media(&batch).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("inbound media processing failed: {err:#}");
                None
            }
        };

        let route = match self
            .runtime
            .resolve_route(
                &account.name,
                &batch.origin.user_id,
                batch.origin.chat_id.as_deref(),
            )
            .await
        {
            Ok(route) => route,
            Err(err) => {
                tracing::error!("route resolution failed: {err:#}");
                self.store
                    .set_stream_error(&stream_id, &format!("Error: {err}"));
                self.finalize(&batch, &bctx).await;
                return;
            }
        };

        let mut ctx = InboundContext {
            body: envelope_body(&batch, &raw_body),
            raw_body: raw_body.clone(),
            command_body: command_body.clone(),
            source: format!("wecom:{}", batch.origin.user_id),
            target: format!("user:{}", batch.origin.user_id),
            session_key: route.session_key,
            chat: batch.origin.chat,
            provider: "wecom",
            surface: "bot",
            command_authorized: false,
            media_path: media.as_ref().map(|(saved, _, _)| saved.path.clone()),
            media_kind: media.as_ref().map(|(_, kind, _)| kind.clone()),
            media_url: media.as_ref().and_then(|(_, _, url)| url.clone()),
        };

        match self.runtime.authorize_command(&ctx) {
            CommandVerdict::Denied => {
                self.store
                    .finish_stream_with(&stream_id, PROMPT_UNAUTHORIZED, FallbackMode::None);
                if let Err(err) = self.push_frame(&stream_id, &account, false).await {
                    tracing::warn!("unauthorized prompt push failed: {err:#}");
                }
                self.finalize(&batch, &bctx).await;
                return;
            }
            CommandVerdict::Allowed => ctx.command_authorized = true,
            CommandVerdict::NotCommand => {}
        }

        if let Err(err) = self.runtime.record_inbound(&ctx).await {
            tracing::warn!("inbound session record failed: {err:#}");
        }

        // The agent must not answer through its own messaging tool; delivery
        // stays on this stream.
        self.runtime.deny_sandbox_tool("message");

        let mut blocks = match self.runtime.dispatch(ctx).await {
            Ok(rx) => rx,
            Err(err) => {
                tracing::error!("agent dispatch failed: {err:#}");
                self.store
                    .set_stream_error(&stream_id, &format!("Error: {err}"));
                self.finalize(&batch, &bctx).await;
                return;
            }
        };

        while let Some(block) = blocks.recv().await {
            self.handle_block(&bctx, block).await;
        }

        self.finalize(&batch, &bctx).await;
    }

    /// Fold one streamed agent block into the reply slot.
    async fn handle_block(&self, bctx: &BlockCtx, block: AgentBlock) {
        let sid = &bctx.stream_id;

        // Table conversion must not touch chain-of-thought spans.
        let (protected, spans) = protect_think_spans(&block.text);
        let converted = convert_tables(&protected, bctx.account.table_mode);
        let mut text = restore_think_spans(&converted, &spans);

        if bctx.is_reset_command {
            if let Some(localized) = rewrite_command_ack(&text) {
                text = localized.to_string();
            }
        }

        if let Some(card) = detect_template_card(&text) {
            if !bctx.is_group && self.store.reply_url(sid).is_some() {
                match self.push_card(sid, &bctx.account, &card).await {
                    Ok(()) => {
                        self.store
                            .finish_stream_with(sid, PROMPT_CARD_SENT, FallbackMode::None);
                        tracing::info!("template card delivered: stream={sid}");
                        return;
                    }
                    Err(err) => {
                        tracing::warn!("template card push failed, degrading to text: {err:#}");
                        text = render_template_card_text(&card);
                    }
                }
            } else {
                text = render_template_card_text(&card);
            }
        }

        // The DM transcript collects everything, including what the frozen
        // bot view will never show.
        if !text.is_empty() {
            self.store.append_dm_text(sid, &text);
        }

        let Some(snapshot) = self.store.stream_snapshot(sid) else {
            return;
        };
        if snapshot.fallback == FallbackMode::None
            && snapshot.created_at.elapsed() + BOT_WINDOW_MARGIN >= BOT_STREAM_WINDOW
        {
            let prompt = if bctx.account.application_configured() {
                PROMPT_TIMEOUT_DM
            } else {
                PROMPT_TIMEOUT_NO_APP
            };
            self.store.finish_stream_with(sid, prompt, FallbackMode::Timeout);
            if self.store.mark_fallback_prompt_sent(sid) {
                if let Err(err) = self.push_frame(sid, &bctx.account, false).await {
                    tracing::warn!("timeout prompt push failed: {err:#}");
                }
            }
            return;
        }

        let mut media_refs = block.all_media();
        for candidate in inferred_image_paths(&text, &bctx.raw_body) {
            if !media_refs.contains(&candidate) {
                media_refs.push(candidate);
            }
        }
        for item in media_refs {
            self.handle_block_media(bctx, &item).await;
        }

        let Some(snapshot) = self.store.stream_snapshot(sid) else {
            return;
        };
        if snapshot.fallback == FallbackMode::None && !text.is_empty() {
            self.store.append_stream_text(sid, &text);
        }
    }

    async fn handle_block_media(&self, bctx: &BlockCtx, item: &str) {
        let sid = &bctx.stream_id;
        if is_image_ref(item) {
            if is_local_path(item) {
                match load_local_image(item).await {
                    Ok(Some(image)) => self.store.push_image(sid, image),
                    Ok(None) => tracing::warn!("agent image path does not exist: {item}"),
                    Err(err) => tracing::warn!("agent image load failed: {item} — {err:#}"),
                }
            } else {
                match self.runtime.fetch_remote_media(item).await {
                    Ok(bytes) if !bytes.is_empty() => {
                        self.store.push_image(sid, encode_image(&bytes));
                    }
                    Ok(_) => tracing::warn!("agent image fetch returned empty body: {item}"),
                    Err(err) => tracing::warn!("agent image fetch failed: {item} — {err:#}"),
                }
            }
            return;
        }
        self.file_fallback(bctx, item).await;
    }

    /// Non-image attachment: the bot stream cannot carry it, so deliver it
    /// as an application DM and tell the user once on the stream.
    async fn file_fallback(&self, bctx: &BlockCtx, item: &str) {
        let sid = &bctx.stream_id;
        self.store.enter_fallback(sid, FallbackMode::Media);

        if !bctx.account.application_configured() {
            if self.store.mark_fallback_prompt_sent(sid) {
                self.store
                    .finish_stream_with(sid, PROMPT_APP_UNCONFIGURED, FallbackMode::Media);
                if let Err(err) = self.push_frame(sid, &bctx.account, false).await {
                    tracing::warn!("unconfigured-app prompt push failed: {err:#}");
                }
            }
            return;
        }

        if self.store.note_media_key(sid, item) {
            if let Err(err) = self.dm_file(&bctx.account, &bctx.user_id, item).await {
                tracing::warn!("file DM delivery failed: {item} — {err:#}");
                if err.to_string().contains("too large") {
                    self.store.set_stream_content(sid, PROMPT_MEDIA_TOO_LARGE);
                }
            }
        }

        if self.store.mark_fallback_prompt_sent(sid) {
            self.store
                .finish_stream_with(sid, PROMPT_FILE_DM, FallbackMode::Media);
            if let Err(err) = self.push_frame(sid, &bctx.account, false).await {
                tracing::warn!("file fallback prompt push failed: {err:#}");
            }
        }
    }

    async fn dm_file(&self, account: &ResolvedAccount, user_id: &str, item: &str) -> Result<()> {
        let bytes = if is_local_path(item) {
            tokio::fs::read(item)
                .await
                .with_context(|| format!("failed to read {item}"))?
        } else {
            self.runtime.fetch_remote_media(item).await?
        };
        let file_name = file_name_of(item);
        let kind = crate::outbound::api::MediaKind::for_file_name(&file_name);
        let media_id = self
            .api
            .upload_media(account, kind, &file_name, bytes)
            .await?;
        self.api
            .send_media(account, &SendTarget::User(user_id.to_string()), kind, &media_id)
            .await
    }

    /// "Send /tmp/x to me" style requests bypass the agent.
    async fn handle_send_intent(&self, bctx: &BlockCtx, paths: &[String]) {
        let sid = &bctx.stream_id;
        let (images, files): (Vec<_>, Vec<_>) =
            paths.iter().cloned().partition(|p| is_image_ref(p));

        for path in &images {
            match load_local_image(path).await {
                Ok(Some(image)) => self.store.push_image(sid, image),
                Ok(None) => tracing::warn!("send-intent image missing: {path}"),
                Err(err) => tracing::warn!("send-intent image load failed: {path} — {err:#}"),
            }
        }

        if files.is_empty() {
            self.store.set_stream_content(sid, PROMPT_IMAGES_SENT);
            self.store.finish_stream(sid);
            if let Err(err) = self.push_frame(sid, &bctx.account, true).await {
                tracing::warn!("send-intent final frame push failed: {err:#}");
            }
            return;
        }

        for path in &files {
            self.file_fallback(bctx, path).await;
        }
    }

    /// Batch wrap-up: default command ack, monotonic finish, the two final
    /// delivery legs, ack-stream drain and queue advance.
    async fn finalize(&self, batch: &PendingBatch, bctx: &BlockCtx) {
        let sid = &batch.stream_id;
        let account = &batch.origin.account;

        if bctx.is_reset_command {
            if let Some(snapshot) = self.store.stream_snapshot(sid) {
                if !snapshot.finished && snapshot.content.trim().is_empty() {
                    self.store.set_stream_content(sid, PROMPT_RESET_ACK);
                }
            }
        }
        self.store.finish_stream(sid);

        if let Some(snapshot) = self.store.stream_snapshot(sid) {
            if snapshot.fallback == FallbackMode::Timeout
                && account.application_configured()
                && self.store.mark_final_delivered(sid)
            {
                for chunk in chunk_utf8(&snapshot.dm_content, STREAM_MAX_BYTES) {
                    if let Err(err) = self
                        .api
                        .send_text(account, &SendTarget::User(snapshot.user_id.clone()), &chunk)
                        .await
                    {
                        tracing::warn!("timeout final DM delivery failed: {err:#}");
                        break;
                    }
                }
            }

            // Clients that missed the last refresh still get the images.
            if snapshot.chat.is_group()
                && !snapshot.images.is_empty()
                && self.store.reply_url(sid).is_some()
            {
                if let Err(err) = self.push_frame(sid, account, true).await {
                    tracing::warn!("group image final push failed: {err:#}");
                }
            }
        }

        for ack in self.store.take_ack_streams(&batch.batch_key) {
            self.store.set_stream_content(&ack, PROMPT_MERGED_DONE);
            self.store.finish_stream(&ack);
        }

        self.store.on_stream_finished(sid);
    }

    /// Push the current frame through the stored passive-reply URL.
    async fn push_frame(
        &self,
        stream_id: &str,
        account: &ResolvedAccount,
        include_images: bool,
    ) -> Result<()> {
        let snapshot = self
            .store
            .stream_snapshot(stream_id)
            .ok_or_else(|| anyhow::anyhow!("stream gone: {stream_id}"))?;
        let frame = stream_frame(&snapshot, include_images);
        self.push_json(stream_id, account, frame).await
    }

    async fn push_card(
        &self,
        stream_id: &str,
        account: &ResolvedAccount,
        card: &Value,
    ) -> Result<()> {
        let payload = serde_json::json!({
            "msgtype": "template_card",
            "template_card": card.get("template_card").cloned().unwrap_or(Value::Null),
        });
        self.push_json(stream_id, account, payload).await
    }

    async fn push_json(
        &self,
        stream_id: &str,
        account: &ResolvedAccount,
        payload: Value,
    ) -> Result<()> {
        let network = account.network.clone();
        self.store
            .use_reply_url(stream_id, |url, proxy| async move {
                let mut network = network;
                if proxy.is_some() {
                    network.egress_proxy_url = proxy;
                }
                let client = http::client_for(&network)?;
                let response = client
                    .post(&url)
                    .json(&payload)
                    .timeout(http::request_timeout(&network))
                    .send()
                    .await
                    .context("reply url push failed")?;
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                if !status.is_success() {
                    anyhow::bail!("reply url push failed: status={status} body={body}");
                }
                crate::outbound::api::check_business_body(&body)
            })
            .await
    }

    /// Decrypt and persist media attached to the batch's first message.
    /// Mixed messages surface only their first media item.
    async fn materialize_inbound_media(
        &self,
        batch: &PendingBatch,
    ) -> Result<Option<(SavedMedia, String, Option<String>)>> {
        let origin = &batch.origin;
        let (kind, url) = match origin.msg_type.as_str() {
            "image" => (
                "image",
                origin
                    .payload
                    .get("image")
                    .and_then(|v| v.get("url"))
                    .and_then(Value::as_str),
            ),
            "file" => (
                "file",
                origin
                    .payload
                    .get("file")
                    .and_then(|v| v.get("url"))
                    .and_then(Value::as_str),
            ),
            "mixed" => {
                let first = origin
                    .payload
                    .get("mixed")
                    .and_then(|v| v.get("msg_item"))
                    .and_then(Value::as_array)
                    .and_then(|items| {
                        items.iter().find_map(|item| {
                            let item_type = item.get("msgtype").and_then(Value::as_str)?;
                            if item_type != "image" && item_type != "file" {
                                return None;
                            }
                            let url = item
                                .get(item_type)
                                .and_then(|v| v.get("url"))
                                .and_then(Value::as_str)?;
                            Some((item_type, url))
                        })
                    });
                match first {
                    Some((kind, url)) => (kind, Some(url)),
                    None => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
        let Some(url) = url.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(None);
        };

        let account = &origin.account;
        let client = http::client_for(&account.network)?;
        let response = client
            .get(url)
            .timeout(http::request_timeout(&account.network))
            .send()
            .await
            .context("inbound media download failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("inbound media download failed: status={status}");
        }
        let encrypted = http::read_body_capped(response, account.network.media_max_bytes).await?;

        let codec = EnvelopeCodec::new(&account.bot_token, &account.bot_encoding_aes_key, "")?;
        let bytes = codec.decrypt_media(&encrypted)?;

        let (ext, mime) = match kind {
            "image" => ("png", "image/png"),
            _ => ("bin", "application/octet-stream"),
        };
        let file_name = format!(
            "inbound_{}_{}.{ext}",
            crate::gateway::unix_timestamp_now(),
            crate::gateway::random_ascii_token(6)
        );
        let saved = self.runtime.save_media(&bytes, &file_name, mime).await?;
        Ok(Some((
            saved,
            kind.to_string(),
            Some(url.to_string()),
        )))
    }
}

// ── Inbound body building ───────────────────────────────────────

/// Render one inbound message into the raw agent body.
pub(crate) fn build_inbound_body(msg_type: &str, payload: &Value) -> String {
    let body = match msg_type {
        "text" => payload
            .get("text")
            .and_then(|v| v.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string(),
        "voice" => {
            let transcript = payload
                .get("voice")
                .and_then(|v| v.get("content"))
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("");
            if transcript.is_empty() {
                "[voice]".to_string()
            } else {
                transcript.to_string()
            }
        }
        "mixed" => {
            let mut lines = Vec::new();
            if let Some(items) = payload
                .get("mixed")
                .and_then(|v| v.get("msg_item"))
                .and_then(Value::as_array)
            {
                for item in items {
                    match item.get("msgtype").and_then(Value::as_str).unwrap_or("") {
                        "text" => {
                            if let Some(text) = item
                                .get("text")
                                .and_then(|v| v.get("content"))
                                .and_then(Value::as_str)
                                .map(str::trim)
                                .filter(|value| !value.is_empty())
                            {
                                lines.push(text.to_string());
                            }
                        }
                        "image" => lines.push("[image]".to_string()),
                        "file" => lines.push("[file]".to_string()),
                        other => lines.push(format!("[{other}]")),
                    }
                }
            }
            lines.join("\n")
        }
        "image" => format!(
            "[image] {}",
            payload
                .get("image")
                .and_then(|v| v.get("url"))
                .and_then(Value::as_str)
                .unwrap_or("")
        )
        .trim()
        .to_string(),
        "file" => format!(
            "[file] {}",
            payload
                .get("file")
                .and_then(|v| v.get("url"))
                .and_then(Value::as_str)
                .unwrap_or("")
        )
        .trim()
        .to_string(),
        "event" => format!(
            "[event] {}",
            payload
                .get("event")
                .and_then(|v| v.get("eventtype"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
        ),
        "stream" => format!(
            "[stream_refresh] {}",
            payload
                .get("stream")
                .and_then(|v| v.get("id"))
                .and_then(Value::as_str)
                .unwrap_or("")
        )
        .trim()
        .to_string(),
        "link" => {
            let title = payload
                .get("link")
                .and_then(|v| v.get("title"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let url = payload
                .get("link")
                .and_then(|v| v.get("url"))
                .and_then(Value::as_str)
                .unwrap_or("");
            format!("[link] {title} {url}").trim().to_string()
        }
        "location" => {
            let name = payload
                .get("location")
                .and_then(|v| v.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("");
            format!("[location] {name}").trim().to_string()
        }
        other => format!("[{other}]"),
    };

    match quote_text(payload) {
        Some(quote) => format!("{body}\n\n> {quote}"),
        None => body,
    }
}

fn quote_text(payload: &Value) -> Option<String> {
    let quote = payload.get("quote")?;
    let quote_type = quote.get("msgtype").and_then(Value::as_str)?;
    let text = match quote_type {
        "text" => quote
            .get("text")
            .and_then(|v| v.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| "[引用文本为空]".to_string()),
        "voice" => quote
            .get("voice")
            .and_then(|v| v.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|v| format!("[引用语音] {v}"))
            .unwrap_or_else(|| "[引用语音]".to_string()),
        "image" => "[引用图片]".to_string(),
        "file" => "[引用文件]".to_string(),
        other => format!("[引用消息 type={other}]"),
    };
    Some(text)
}

fn envelope_body(batch: &PendingBatch, raw: &str) -> String {
    let origin = &batch.origin;
    let chat = match origin.chat {
        ChatKind::Direct => "direct",
        ChatKind::Group => "group",
    };
    let chat_id = origin.chat_id.as_deref().unwrap_or("-");
    format!(
        "[WeCom] user={} chat={chat} chat_id={chat_id} bot={}\n\n{raw}",
        origin.user_id, origin.ai_agent_id
    )
}

// ── Commands ────────────────────────────────────────────────────

fn parse_command_body(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    trimmed.starts_with('/').then(|| trimmed.to_string())
}

pub(crate) fn is_reset_command(command: Option<&str>) -> bool {
    let Some(command) = command else { return false };
    matches!(
        command.split_whitespace().next().unwrap_or(""),
        "/new" | "/reset"
    )
}

/// The runtime acknowledges /new and /reset in English; localize when the
/// ack is headed for a chat surface.
pub(crate) fn rewrite_command_ack(text: &str) -> Option<&'static str> {
    let lowered = text.trim().to_ascii_lowercase();
    if lowered.is_empty() || lowered.len() > 200 {
        return None;
    }
    if lowered.contains("reset") && (lowered.contains("conversation") || lowered.contains("session"))
    {
        return Some(PROMPT_RESET_ACK);
    }
    if lowered.contains("new conversation") || lowered.contains("new session") {
        return Some(PROMPT_NEW_SESSION_ACK);
    }
    None
}

// ── Think-span protection ───────────────────────────────────────

fn protect_think_spans(text: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(text.len());
    let mut spans = Vec::new();
    let mut rest = text;
    loop {
        match rest.find(THINK_OPEN) {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start..];
                match after.find(THINK_CLOSE) {
                    Some(end_rel) => {
                        let end = end_rel + THINK_CLOSE.len();
                        out.push_str(&think_placeholder(spans.len()));
                        spans.push(after[..end].to_string());
                        rest = &after[end..];
                    }
                    None => {
                        // Unterminated span: leave as-is.
                        out.push_str(after);
                        break;
                    }
                }
            }
        }
    }
    (out, spans)
}

fn restore_think_spans(text: &str, spans: &[String]) -> String {
    let mut out = text.to_string();
    for (index, span) in spans.iter().enumerate() {
        out = out.replace(&think_placeholder(index), span);
    }
    out
}

fn think_placeholder(index: usize) -> String {
    format!("\u{e000}think{index}\u{e000}")
}

// ── Markdown tables ─────────────────────────────────────────────

/// Rewrite markdown tables for a chat surface that renders raw pipes.
fn convert_tables(text: &str, mode: TableMode) -> String {
    if mode == TableMode::Keep || !text.contains('|') {
        return text.to_string();
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut index = 0;
    while index < lines.len() {
        let block_len = table_block_len(&lines[index..]);
        if block_len == 0 {
            out.push(lines[index].to_string());
            index += 1;
            continue;
        }
        let block = &lines[index..index + block_len];
        match mode {
            TableMode::Fence => {
                out.push("```".to_string());
                out.extend(block.iter().map(|line| line.to_string()));
                out.push("```".to_string());
            }
            TableMode::Bullets => out.extend(table_to_bullets(block)),
            TableMode::Keep => unreachable!("handled above"),
        }
        index += block_len;
    }
    let mut rendered = out.join("\n");
    if text.ends_with('\n') {
        rendered.push('\n');
    }
    rendered
}

/// A table block is a header row, a separator row, then data rows, each
/// starting with a pipe.
fn table_block_len(lines: &[&str]) -> usize {
    if lines.len() < 2 {
        return 0;
    }
    let is_row = |line: &str| line.trim_start().starts_with('|');
    let is_separator = |line: &str| {
        let trimmed = line.trim();
        trimmed.starts_with('|')
            && trimmed
                .chars()
                .all(|c| matches!(c, '|' | '-' | ':' | ' '))
            && trimmed.contains('-')
    };
    if !is_row(lines[0]) || !is_separator(lines[1]) {
        return 0;
    }
    let mut len = 2;
    while len < lines.len() && is_row(lines[len]) && !is_separator(lines[len]) {
        len += 1;
    }
    len
}

fn split_row(line: &str) -> Vec<String> {
    line.trim()
        .trim_matches('|')
        .split('|')
        .map(|cell| cell.trim().to_string())
        .collect()
}

fn table_to_bullets(block: &[&str]) -> Vec<String> {
    let headers = split_row(block[0]);
    let mut out = Vec::new();
    for row in &block[2..] {
        let cells = split_row(row);
        let parts: Vec<String> = headers
            .iter()
            .zip(cells.iter())
            .filter(|(header, cell)| !header.is_empty() || !cell.is_empty())
            .map(|(header, cell)| format!("{header}: {cell}"))
            .collect();
        out.push(format!("- {}", parts.join("；")));
    }
    out
}

// ── Template cards ──────────────────────────────────────────────

fn detect_template_card(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') || !trimmed.contains("\"template_card\"") {
        return None;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .filter(|value| value.get("template_card").is_some())
}

/// Group chats and url-less streams cannot carry a card; render it to text.
fn render_template_card_text(card: &Value) -> String {
    let body = card.get("template_card").cloned().unwrap_or(Value::Null);
    let mut lines = Vec::new();
    if let Some(title) = body
        .get("main_title")
        .and_then(|v| v.get("title"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        lines.push(title.to_string());
    }
    if let Some(desc) = body
        .get("main_title")
        .and_then(|v| v.get("desc"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        lines.push(desc.to_string());
    }
    if let Some(sub) = body
        .get("sub_title_text")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        lines.push(sub.to_string());
    }
    if let Some(buttons) = body.get("button_list").and_then(Value::as_array) {
        for button in buttons {
            if let Some(text) = button.get("text").and_then(Value::as_str) {
                lines.push(format!("[按钮] {text}"));
            }
        }
    }
    if lines.is_empty() {
        "[交互卡片]".to_string()
    } else {
        lines.join("\n")
    }
}

// ── Local media paths ───────────────────────────────────────────

fn image_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:/Users|/tmp)/[^\s'"()（）【】，。；！？]+\.(?:png|jpe?g|gif|webp|bmp)"#)
            .expect("image path pattern")
    })
}

fn any_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?:/Users|/tmp)/[^\s'"()（）【】，。；！？]+"#).expect("local path pattern")
    })
}

/// Local image paths mentioned in agent text, honored only when the exact
/// path also appeared in the user's own message — a model cannot exfiltrate
/// files the user never named.
fn inferred_image_paths(text: &str, raw_body: &str) -> Vec<String> {
    let mut out = Vec::new();
    for found in image_path_regex().find_iter(text) {
        let path = found.as_str().to_string();
        if raw_body.contains(&path) && !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

const SEND_VERBS: &[&str] = &["发送", "发给", "帮我发", "发一下", "发到", "传给"];

/// Detect "send me this local file" requests.
fn local_send_intent(raw: &str) -> Option<Vec<String>> {
    if !SEND_VERBS.iter().any(|verb| raw.contains(verb)) {
        return None;
    }
    let paths: Vec<String> = any_path_regex()
        .find_iter(raw)
        .map(|m| m.as_str().to_string())
        .collect();
    if paths.is_empty() {
        None
    } else {
        Some(paths)
    }
}

fn is_local_path(item: &str) -> bool {
    item.starts_with("/Users/") || item.starts_with("/tmp/")
}

fn is_image_ref(item: &str) -> bool {
    let lowered = item.to_ascii_lowercase();
    let stem = lowered.split(['?', '#']).next().unwrap_or(&lowered);
    ["png", "jpg", "jpeg", "gif", "webp", "bmp"]
        .iter()
        .any(|ext| stem.ends_with(&format!(".{ext}")))
}

fn file_name_of(item: &str) -> String {
    let stem = item.split(['?', '#']).next().unwrap_or(item);
    Path::new(stem)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| "attachment.bin".to_string())
}

async fn load_local_image(path: &str) -> Result<Option<StreamImage>> {
    if tokio::fs::metadata(path).await.is_err() {
        return Ok(None);
    }
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {path}"))?;
    Ok(Some(encode_image(&bytes)))
}

fn encode_image(bytes: &[u8]) -> StreamImage {
    StreamImage {
        base64: base64::engine::general_purpose::STANDARD.encode(bytes),
        md5: format!("{:x}", md5_crate::compute(bytes)),
    }
}

/// Split into UTF-8-safe chunks of at most `max` bytes.
pub(crate) fn chunk_utf8(input: &str, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let head = crate::gateway::store::head_utf8(rest, max);
        if head.is_empty() {
            break;
        }
        out.push(head.to_string());
        rest = &rest[head.len()..];
    }
    out
}
