use anyhow::{anyhow, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::agent::{ChatKind, CommandVerdict, InboundContext};
use crate::gateway::driver::{is_reset_command, rewrite_command_ack};
use crate::gateway::{AccountHandle, AppState, CallbackQuery, MAX_BODY_BYTES};
use crate::outbound::api::MediaKind;
use crate::outbound::target::SendTarget;

/// WeCom truncates application text messages beyond this.
const APP_TEXT_CHUNK_BYTES: usize = 2048;
/// Inline preview cap for likely-text attachments.
const TEXT_PREVIEW_CHARS: usize = 12_000;
/// Bytes sniffed to decide whether an attachment is text.
const TEXT_SNIFF_BYTES: usize = 4_096;

const PROMPT_BAD_SIGNATURE: &str = "签名校验失败，请检查回调配置。";
const PROMPT_BAD_ENVELOPE: &str = "消息解密失败，请检查 EncodingAESKey 配置。";
const PROMPT_UNAUTHORIZED: &str =
    "该指令未被授权执行。请联系管理员调整私信指令策略，或将你加入指令白名单后重试。";
const PROMPT_AGENT_FAILED: &str = "抱歉，我暂时无法处理这条消息。";
const PROMPT_MEDIA_TOO_LARGE: &str = "附件超出大小限制，请调高 media.max_bytes 后重试。";
const NOTICE_UNSUPPORTED_FORMAT: &str =
    "暂不支持提取该格式的内容。可提取格式：txt、md、log、csv、json 及各类源代码等文本文件。";

/// One inbound application-channel message, parsed from PascalCase XML.
#[derive(Debug, Clone, Default)]
pub(crate) struct AppInbound {
    pub msg_type: String,
    pub from_user: String,
    pub msg_id: String,
    pub content: String,
    pub media_id: String,
    pub file_name: String,
    pub recognition: String,
    pub event: String,
}

impl AppInbound {
    pub(crate) fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let field = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let msg_type = field("MsgType");
        if msg_type.is_empty() {
            anyhow::bail!("missing MsgType");
        }
        Ok(Self {
            msg_type,
            from_user: field("FromUserName"),
            msg_id: field("MsgId"),
            content: field("Content"),
            media_id: field("MediaId"),
            file_name: field("FileName"),
            recognition: field("Recognition"),
            event: field("Event"),
        })
    }
}

/// Flatten a WeCom XML envelope into tag → text, accepting CDATA and plain
/// text nodes.
pub(crate) fn parse_xml_fields(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut buffer = Vec::new();
    let mut current_tag: Option<String> = None;
    let mut output = HashMap::new();

    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(Event::Start(event)) => {
                current_tag =
                    Some(String::from_utf8_lossy(event.local_name().as_ref()).to_string());
            }
            Ok(Event::Text(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = event
                        .unescape()
                        .map_err(|_| anyhow!("xml text decode failed"))?
                        .trim()
                        .to_string();
                    if !text.is_empty() {
                        output.insert(tag, text);
                    }
                }
            }
            Ok(Event::CData(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = String::from_utf8_lossy(event.as_ref()).trim().to_string();
                    if !text.is_empty() {
                        output.insert(tag, text);
                    }
                }
            }
            Ok(Event::End(_)) => {
                current_tag = None;
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(anyhow!("xml parse failed: {err}")),
            _ => {}
        }
        buffer.clear();
    }
    Ok(output)
}

fn find_account<'a>(
    state: &'a AppState,
    query: &CallbackQuery,
    encrypt: &str,
) -> Option<(&'a AccountHandle, &'a crate::gateway::crypto::EnvelopeCodec)> {
    let signature = query.signature()?;
    state.accounts.iter().find_map(|handle| {
        let codec = handle.app_codec.as_ref()?;
        codec
            .verify_signature(signature, query.timestamp(), query.nonce(), encrypt)
            .then_some((handle, codec))
    })
}

pub async fn handle_verify(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(echostr) = query.echostr.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing echostr").into_response();
    };

    let Some((_handle, codec)) = find_account(&state, &query, echostr) else {
        return (StatusCode::UNAUTHORIZED, PROMPT_BAD_SIGNATURE).into_response();
    };

    match codec.decrypt(echostr) {
        Ok(plain) => (StatusCode::OK, plain).into_response(),
        Err(err) => {
            tracing::warn!("application url verify decrypt failed: {err:#}");
            (StatusCode::BAD_REQUEST, PROMPT_BAD_ENVELOPE).into_response()
        }
    }
}

/// POST callback. The `success` acknowledgement goes out before any agent
/// work starts; replies travel through the active API instead of this
/// response.
pub async fn handle_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Response {
    if body.len() > MAX_BODY_BYTES {
        return (StatusCode::BAD_REQUEST, "body too large").into_response();
    }
    let body = String::from_utf8_lossy(&body).to_string();

    let encrypt = match parse_xml_fields(&body)
        .ok()
        .and_then(|fields| fields.get("Encrypt").cloned())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        Some(value) => value,
        None => return (StatusCode::BAD_REQUEST, "invalid envelope").into_response(),
    };

    let Some((handle, codec)) = find_account(&state, &query, &encrypt) else {
        return (StatusCode::UNAUTHORIZED, PROMPT_BAD_SIGNATURE).into_response();
    };

    let plaintext = match codec.decrypt(&encrypt) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("application callback decrypt failed: {err:#}");
            return (StatusCode::BAD_REQUEST, PROMPT_BAD_ENVELOPE).into_response();
        }
    };

    let inbound = match parse_xml_fields(&plaintext)
        .and_then(|fields| AppInbound::from_fields(&fields))
    {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("application callback parse failed: {err}");
            return (StatusCode::OK, "success").into_response();
        }
    };

    if !inbound.msg_id.is_empty() && state.store.app_msg_seen(&inbound.msg_id) {
        tracing::debug!("application duplicate msg_id={}", inbound.msg_id);
        return (StatusCode::OK, "success").into_response();
    }

    if inbound.msg_type == "event" {
        tracing::info!("application event ignored: event={}", inbound.event);
        return (StatusCode::OK, "success").into_response();
    }

    let account = Arc::clone(&handle.account);
    let state_clone = state.clone();
    tokio::spawn(async move {
        process_app_message(state_clone, account, inbound).await;
    });

    (StatusCode::OK, "success").into_response()
}

async fn process_app_message(
    state: AppState,
    account: Arc<crate::config::ResolvedAccount>,
    inbound: AppInbound,
) {
    let user = inbound.from_user.clone();
    if user.is_empty() {
        tracing::warn!("application message without sender dropped");
        return;
    }
    let target = SendTarget::User(user.clone());

    let raw_body = match build_app_body(&state, &account, &inbound).await {
        Ok(value) => value,
        Err(err) => {
            tracing::error!("application inbound processing failed: {err:#}");
            let prompt = if err.to_string().contains("too large") {
                PROMPT_MEDIA_TOO_LARGE
            } else {
                PROMPT_AGENT_FAILED
            };
            let _ = state.api.send_text(&account, &target, prompt).await;
            return;
        }
    };

    let route = match state
        .runtime
        .resolve_route(&account.name, &user, None)
        .await
    {
        Ok(route) => route,
        Err(err) => {
            tracing::error!("application route resolution failed: {err:#}");
            return;
        }
    };

    let command_body = {
        let trimmed = raw_body.trim();
        trimmed.starts_with('/').then(|| trimmed.to_string())
    };
    let is_reset = is_reset_command(command_body.as_deref());
    let mut ctx = InboundContext {
        body: format!("[WeCom应用] user={user}\n\n{raw_body}"),
        raw_body: raw_body.clone(),
        command_body,
        source: format!("wecom:{user}"),
        target: format!("user:{user}"),
        session_key: route.session_key,
        chat: ChatKind::Direct,
        provider: "wecom",
        surface: "application",
        command_authorized: false,
        media_path: None,
        media_kind: None,
        media_url: None,
    };

    match state.runtime.authorize_command(&ctx) {
        CommandVerdict::Denied => {
            if let Err(err) = state
                .api
                .send_text(&account, &target, PROMPT_UNAUTHORIZED)
                .await
            {
                tracing::warn!("unauthorized reply send failed: {err:#}");
            }
            return;
        }
        CommandVerdict::Allowed => ctx.command_authorized = true,
        CommandVerdict::NotCommand => {}
    }

    if let Err(err) = state.runtime.record_inbound(&ctx).await {
        tracing::warn!("application inbound record failed: {err:#}");
    }

    let mut blocks = match state.runtime.dispatch(ctx).await {
        Ok(rx) => rx,
        Err(err) => {
            tracing::error!("application agent dispatch failed: {err:#}");
            let _ = state
                .api
                .send_text(&account, &target, PROMPT_AGENT_FAILED)
                .await;
            return;
        }
    };

    let mut reply = String::new();
    let mut sent_media: HashSet<String> = HashSet::new();
    while let Some(block) = blocks.recv().await {
        let mut text = block.text.clone();
        if is_reset {
            if let Some(localized) = rewrite_command_ack(&text) {
                text = localized.to_string();
            }
        }
        if !text.is_empty() {
            if !reply.is_empty() {
                reply.push('\n');
            }
            reply.push_str(&text);
        }
        for item in block.all_media() {
            if sent_media.insert(item.clone()) {
                if let Err(err) = dm_agent_media(&state, &account, &user, &item).await {
                    tracing::warn!("application media reply failed: {item} — {err:#}");
                }
            }
        }
    }

    if reply.trim().is_empty() && sent_media.is_empty() {
        reply = PROMPT_AGENT_FAILED.to_string();
    }
    for chunk in crate::gateway::driver::chunk_utf8(&reply, APP_TEXT_CHUNK_BYTES) {
        if let Err(err) = state.api.send_text(&account, &target, &chunk).await {
            tracing::warn!("application text reply send failed: {err:#}");
            break;
        }
    }
}

/// Produce the raw agent body for one application message, downloading and
/// persisting any attachment through the runtime's media sink.
async fn build_app_body(
    state: &AppState,
    account: &crate::config::ResolvedAccount,
    inbound: &AppInbound,
) -> Result<String> {
    match inbound.msg_type.as_str() {
        "text" => {
            let content = inbound.content.trim();
            if content.is_empty() {
                anyhow::bail!("empty text message");
            }
            Ok(content.to_string())
        }
        "voice" => {
            let transcript = inbound.recognition.trim();
            if transcript.is_empty() {
                Ok("[voice]".to_string())
            } else {
                Ok(transcript.to_string())
            }
        }
        "image" | "video" | "file" => build_app_media_body(state, account, inbound).await,
        other => Ok(format!("[{other}]")),
    }
}

async fn build_app_media_body(
    state: &AppState,
    account: &crate::config::ResolvedAccount,
    inbound: &AppInbound,
) -> Result<String> {
    if inbound.media_id.trim().is_empty() {
        anyhow::bail!("media message without MediaId");
    }
    let downloaded = state.api.download_media(account, &inbound.media_id).await?;

    let file_name = resolve_file_name(inbound, downloaded.file_name.as_deref());
    let is_text = downloaded
        .content_type
        .as_deref()
        .map(|ct| ct.starts_with("text/"))
        .unwrap_or(false)
        || looks_like_text(&downloaded.bytes);
    let mime = effective_mime(
        downloaded.content_type.as_deref(),
        &file_name,
        is_text,
        &inbound.msg_type,
    );

    let saved = state
        .runtime
        .save_media(&downloaded.bytes, &file_name, &mime)
        .await?;

    match inbound.msg_type.as_str() {
        "image" => Ok(format!("[image] {}", saved.path.display())),
        "video" => Ok(format!("[video] {}", saved.path.display())),
        _ => {
            if is_text {
                let preview = preview_text(&downloaded.bytes, TEXT_PREVIEW_CHARS);
                Ok(format!("[file] {file_name}\n{preview}"))
            } else {
                Ok(format!("[file] {file_name}\n{NOTICE_UNSUPPORTED_FORMAT}"))
            }
        }
    }
}

async fn dm_agent_media(
    state: &AppState,
    account: &crate::config::ResolvedAccount,
    user: &str,
    item: &str,
) -> Result<()> {
    let bytes = if item.starts_with('/') {
        tokio::fs::read(item).await?
    } else {
        state.runtime.fetch_remote_media(item).await?
    };
    let file_name = std::path::Path::new(item.split(['?', '#']).next().unwrap_or(item))
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("attachment.bin")
        .to_string();
    let kind = MediaKind::for_file_name(&file_name);
    let media_id = state
        .api
        .upload_media(account, kind, &file_name, bytes)
        .await?;
    state
        .api
        .send_media(account, &SendTarget::User(user.to_string()), kind, &media_id)
        .await
}

fn resolve_file_name(inbound: &AppInbound, disposition: Option<&str>) -> String {
    let from_xml = inbound.file_name.trim();
    if !from_xml.is_empty() {
        return from_xml.to_string();
    }
    if let Some(name) = disposition.map(str::trim).filter(|value| !value.is_empty()) {
        return name.to_string();
    }
    let ext = match inbound.msg_type.as_str() {
        "image" => "png",
        "video" => "mp4",
        "voice" => "amr",
        _ => "bin",
    };
    format!(
        "attachment_{}.{ext}",
        crate::gateway::unix_timestamp_now()
    )
}

/// Sniff the first 4 KiB: ≥ 98% printable-or-whitespace ASCII means text.
fn looks_like_text(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(TEXT_SNIFF_BYTES)];
    if window.is_empty() {
        return false;
    }
    let printable = window
        .iter()
        .filter(|&&b| matches!(b, b'\t' | b'\n' | b'\r') || (0x20..=0x7e).contains(&b))
        .count();
    printable * 100 >= window.len() * 98
}

fn effective_mime(server: Option<&str>, file_name: &str, is_text: bool, msg_type: &str) -> String {
    if let Some(ct) = server.map(str::trim).filter(|value| {
        !value.is_empty() && !value.eq_ignore_ascii_case("application/octet-stream")
    }) {
        return ct.to_string();
    }
    if is_text {
        let ext = file_name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
        return if matches!(ext.as_str(), "md" | "markdown") {
            "text/markdown".to_string()
        } else {
            "text/plain".to_string()
        };
    }
    match msg_type {
        "image" => "image/png".to_string(),
        "video" => "video/mp4".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}

fn preview_text(bytes: &[u8], limit_chars: usize) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .take(limit_chars)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::StubRuntime;
    use crate::config::{NetworkOptions, ResolvedAccount, TableMode};
    use crate::gateway::crypto::EnvelopeCodec;

    const TEST_KEY: &str = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";

    fn test_account() -> ResolvedAccount {
        ResolvedAccount {
            name: "acct".to_string(),
            corp_id: "ww1234".to_string(),
            agent_id: "1000002".to_string(),
            app_secret: "s".to_string(),
            bot_token: "bot-token".to_string(),
            bot_encoding_aes_key: TEST_KEY.to_string(),
            app_token: "app-token".to_string(),
            app_encoding_aes_key: TEST_KEY.to_string(),
            receiver_id: "ww1234".to_string(),
            welcome_text: None,
            stream_placeholder: "1".to_string(),
            table_mode: TableMode::Fence,
            debounce_ms: 1_000,
            network: NetworkOptions::default(),
        }
    }

    fn app_state() -> AppState {
        AppState::new(vec![test_account()], Arc::new(StubRuntime::new(Vec::new()))).unwrap()
    }

    fn signed_query(codec: &EnvelopeCodec, encrypt: &str, echostr: Option<String>) -> CallbackQuery {
        CallbackQuery {
            msg_signature: Some(codec.sign("1700000000", "n1", encrypt)),
            timestamp: Some("1700000000".to_string()),
            nonce: Some("n1".to_string()),
            echostr,
            ..CallbackQuery::default()
        }
    }

    async fn body_text(response: Response) -> String {
        let raw = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&raw).to_string()
    }

    #[tokio::test]
    async fn get_verification_echoes_decrypted_plaintext() {
        let state = app_state();
        let codec = state.accounts[0].app_codec.as_ref().unwrap();
        let echostr = codec.encrypt("7486").unwrap();
        let query = signed_query(codec, &echostr, Some(echostr.clone()));

        let response = handle_verify(State(state.clone()), Query(query)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "7486");
    }

    #[tokio::test]
    async fn post_event_acks_success_before_any_work() {
        let state = app_state();
        let codec = state.accounts[0].app_codec.as_ref().unwrap();
        let plaintext = r#"<xml>
            <FromUserName><![CDATA[zhang]]></FromUserName>
            <MsgType><![CDATA[event]]></MsgType>
            <Event><![CDATA[subscribe]]></Event>
            <MsgId>20001</MsgId>
        </xml>"#;
        let encrypt = codec.encrypt(plaintext).unwrap();
        let body = Bytes::from(format!("<xml><Encrypt><![CDATA[{encrypt}]]></Encrypt></xml>"));
        let query = signed_query(codec, &encrypt, None);

        let response = handle_callback(State(state.clone()), Query(query), body).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "success");
    }

    #[tokio::test]
    async fn duplicate_msg_id_is_dropped_with_success() {
        let state = app_state();
        assert!(!state.store.app_msg_seen("30001"));
        assert!(state.store.app_msg_seen("30001"), "second sighting is a duplicate");

        // The handler path: a repeat POST still answers success.
        let codec = state.accounts[0].app_codec.as_ref().unwrap();
        let plaintext = r#"<xml>
            <FromUserName><![CDATA[zhang]]></FromUserName>
            <MsgType><![CDATA[event]]></MsgType>
            <MsgId>30001</MsgId>
        </xml>"#;
        let encrypt = codec.encrypt(plaintext).unwrap();
        let body = Bytes::from(format!("<xml><Encrypt><![CDATA[{encrypt}]]></Encrypt></xml>"));
        let query = signed_query(codec, &encrypt, None);
        let response = handle_callback(State(state.clone()), Query(query), body).await;
        assert_eq!(body_text(response).await, "success");
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let state = app_state();
        let codec = state.accounts[0].app_codec.as_ref().unwrap();
        let encrypt = codec.encrypt("<xml></xml>").unwrap();
        let body = Bytes::from(format!("<xml><Encrypt><![CDATA[{encrypt}]]></Encrypt></xml>"));
        let query = CallbackQuery {
            msg_signature: Some("f".repeat(40)),
            timestamp: Some("1700000000".to_string()),
            nonce: Some("n1".to_string()),
            ..CallbackQuery::default()
        };
        let response = handle_callback(State(state.clone()), Query(query), body).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn xml_fields_plain_and_cdata() {
        let xml = r#"<xml>
            <ToUserName><![CDATA[ww1]]></ToUserName>
            <FromUserName><![CDATA[zhang]]></FromUserName>
            <MsgType>text</MsgType>
            <Content><![CDATA[你好 &amp; 再见]]></Content>
            <MsgId>10001</MsgId>
        </xml>"#;
        let fields = parse_xml_fields(xml).unwrap();
        assert_eq!(fields.get("ToUserName").map(String::as_str), Some("ww1"));
        assert_eq!(fields.get("MsgType").map(String::as_str), Some("text"));
        assert_eq!(fields.get("MsgId").map(String::as_str), Some("10001"));
        // CDATA content is taken verbatim.
        assert_eq!(
            fields.get("Content").map(String::as_str),
            Some("你好 &amp; 再见")
        );
    }

    #[test]
    fn xml_encrypt_element_both_forms() {
        let cdata = "<xml><Encrypt><![CDATA[ciphertext+base64=]]></Encrypt></xml>";
        let fields = parse_xml_fields(cdata).unwrap();
        assert_eq!(
            fields.get("Encrypt").map(String::as_str),
            Some("ciphertext+base64=")
        );

        let plain = "<xml><Encrypt>ciphertext</Encrypt></xml>";
        let fields = parse_xml_fields(plain).unwrap();
        assert_eq!(fields.get("Encrypt").map(String::as_str), Some("ciphertext"));
    }

    #[test]
    fn app_inbound_requires_msg_type() {
        let mut fields = HashMap::new();
        fields.insert("FromUserName".to_string(), "u".to_string());
        assert!(AppInbound::from_fields(&fields).is_err());
        fields.insert("MsgType".to_string(), "text".to_string());
        fields.insert("Content".to_string(), "hi".to_string());
        let inbound = AppInbound::from_fields(&fields).unwrap();
        assert_eq!(inbound.msg_type, "text");
        assert_eq!(inbound.content, "hi");
    }

    #[test]
    fn text_sniffing_thresholds() {
        assert!(looks_like_text(b"plain ascii log line\nanother line\r\n"));
        assert!(!looks_like_text(&[0u8; 100]));
        assert!(!looks_like_text(b""));

        // 97 printable + 3 binary bytes: under the 98% bar.
        let mut nearly = vec![b'a'; 97];
        nearly.extend_from_slice(&[0u8, 1, 2]);
        assert!(!looks_like_text(&nearly));

        // 99 printable + 1 binary: over the bar.
        let mut mostly = vec![b'a'; 99];
        mostly.push(0u8);
        assert!(looks_like_text(&mostly));

        // CJK text is multi-byte: falls to the generic notice path.
        assert!(!looks_like_text("中文内容中文内容中文内容".as_bytes()));
    }

    #[test]
    fn mime_resolution_prefers_server_header() {
        assert_eq!(
            effective_mime(Some("application/pdf"), "a.pdf", false, "file"),
            "application/pdf"
        );
        assert_eq!(
            effective_mime(Some("application/octet-stream"), "notes.md", true, "file"),
            "text/markdown"
        );
        assert_eq!(effective_mime(None, "build.log", true, "file"), "text/plain");
        assert_eq!(effective_mime(None, "pic", false, "image"), "image/png");
        assert_eq!(
            effective_mime(None, "blob", false, "file"),
            "application/octet-stream"
        );
    }

    #[test]
    fn file_name_resolution_order() {
        let mut inbound = AppInbound {
            msg_type: "file".to_string(),
            file_name: "报告.pdf".to_string(),
            ..AppInbound::default()
        };
        assert_eq!(resolve_file_name(&inbound, Some("other.pdf")), "报告.pdf");

        inbound.file_name = String::new();
        assert_eq!(resolve_file_name(&inbound, Some("other.pdf")), "other.pdf");

        let generated = resolve_file_name(&inbound, None);
        assert!(generated.starts_with("attachment_") && generated.ends_with(".bin"));
    }

    #[test]
    fn preview_caps_characters_not_bytes() {
        let text = "行".repeat(20);
        let preview = preview_text(text.as_bytes(), 10);
        assert_eq!(preview.chars().count(), 10);
    }
}
