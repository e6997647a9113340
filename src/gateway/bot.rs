use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::ChatKind;
use crate::gateway::store::{AdmissionStatus, BatchOrigin};
use crate::gateway::{
    driver, stream_frame, AccountHandle, AppState, CallbackQuery, MAX_BODY_BYTES,
};

pub(crate) const PROMPT_QUEUED: &str = "已收到，已排队处理中...";
pub(crate) const PROMPT_MERGED: &str = "已收到，已合并排队处理中...";
const PROMPT_STREAM_GONE: &str = "任务已结束或不存在。";
const PROMPT_BAD_SIGNATURE: &str = "签名校验失败，请检查回调配置。";
const PROMPT_BAD_ENVELOPE: &str = "消息解密失败，请检查 EncodingAESKey 配置。";

/// One inbound bot-channel message after decryption.
#[derive(Debug, Clone)]
pub(crate) struct BotInbound {
    pub msg_id: String,
    pub msg_type: String,
    pub chat: ChatKind,
    pub chat_id: Option<String>,
    pub user_id: String,
    pub ai_agent_id: String,
    pub response_url: Option<String>,
    pub payload: Value,
}

pub(crate) fn parse_bot_inbound(payload: Value) -> anyhow::Result<BotInbound> {
    let msg_type = payload
        .get("msgtype")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| anyhow::anyhow!("missing msgtype"))?;

    let msg_id = payload
        .get("msgid")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();

    let chat = match payload.get("chattype").and_then(Value::as_str) {
        Some("group") => ChatKind::Group,
        _ => ChatKind::Direct,
    };
    let chat_id = payload
        .get("chatid")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned);

    let user_id = sender_user_id(&payload).unwrap_or_else(|| "unknown".to_string());

    let ai_agent_id = payload
        .get("aibotid")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .trim()
        .to_string();

    let response_url = payload
        .get("response_url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(ToOwned::to_owned);

    Ok(BotInbound {
        msg_id,
        msg_type,
        chat,
        chat_id,
        user_id,
        ai_agent_id,
        response_url,
        payload,
    })
}

/// The sender id has shipped under several spellings.
fn sender_user_id(payload: &Value) -> Option<String> {
    payload
        .get("from")
        .and_then(|v| v.get("userid"))
        .and_then(Value::as_str)
        .or_else(|| payload.get("fromuserid").and_then(Value::as_str))
        .or_else(|| payload.get("from_userid").and_then(Value::as_str))
        .or_else(|| payload.get("fromUserId").and_then(Value::as_str))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

pub(crate) fn conversation_key(account_name: &str, user_id: &str, chat_id: Option<&str>) -> String {
    format!("{account_name}:{user_id}:{}", chat_id.unwrap_or("single"))
}

fn extract_encrypt(body: &[u8]) -> Option<String> {
    let envelope: Value = serde_json::from_slice(body).ok()?;
    envelope
        .get("encrypt")
        .or_else(|| envelope.get("Encrypt"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

/// Pick the first account whose signature verifies for the ciphertext.
fn find_account<'a>(
    state: &'a AppState,
    query: &CallbackQuery,
    encrypt: &str,
) -> Option<&'a AccountHandle> {
    let signature = query.signature()?;
    state.accounts.iter().find(|handle| {
        handle
            .bot_codec
            .verify_signature(signature, query.timestamp(), query.nonce(), encrypt)
    })
}

fn plain_text_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

fn encrypted_reply(handle: &AccountHandle, query: &CallbackQuery, plaintext: &str) -> Response {
    match handle.bot_codec.encrypt_bot_reply(
        plaintext,
        &query.reply_timestamp(),
        &query.reply_nonce(),
    ) {
        Ok(envelope) => plain_text_response(StatusCode::OK, envelope),
        Err(err) => {
            tracing::error!("bot reply encrypt failed: {err:#}");
            plain_text_response(StatusCode::OK, "success".to_string())
        }
    }
}

fn encrypted_frame_reply(
    state: &AppState,
    handle: &AccountHandle,
    query: &CallbackQuery,
    stream_id: &str,
    include_images: bool,
) -> Response {
    let Some(snapshot) = state.store.stream_snapshot(stream_id) else {
        return encrypted_gone_reply(handle, query, stream_id);
    };
    let frame = stream_frame(&snapshot, include_images);
    encrypted_reply(handle, query, &frame.to_string())
}

fn encrypted_gone_reply(handle: &AccountHandle, query: &CallbackQuery, stream_id: &str) -> Response {
    let frame = serde_json::json!({
        "msgtype": "stream",
        "stream": { "id": stream_id, "finish": true, "content": PROMPT_STREAM_GONE },
    });
    encrypted_reply(handle, query, &frame.to_string())
}

/// GET URL verification: prove key ownership by echoing the decrypted
/// `echostr`.
pub async fn handle_verify(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(echostr) = query.echostr.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
        return plain_text_response(StatusCode::BAD_REQUEST, "missing echostr".to_string());
    };

    let Some(handle) = find_account(&state, &query, echostr) else {
        return plain_text_response(StatusCode::UNAUTHORIZED, PROMPT_BAD_SIGNATURE.to_string());
    };

    match handle.bot_codec.decrypt(echostr) {
        Ok(plain) => plain_text_response(StatusCode::OK, plain),
        Err(err) => {
            tracing::warn!("bot url verify decrypt failed: {err:#}");
            plain_text_response(StatusCode::BAD_REQUEST, PROMPT_BAD_ENVELOPE.to_string())
        }
    }
}

/// POST message callback. The encrypted placeholder reply is produced on the
/// request path; all heavy work happens after it is committed.
pub async fn handle_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Response {
    if body.len() > MAX_BODY_BYTES {
        return plain_text_response(StatusCode::BAD_REQUEST, "body too large".to_string());
    }

    let Some(encrypt) = extract_encrypt(&body) else {
        return plain_text_response(StatusCode::BAD_REQUEST, "invalid envelope".to_string());
    };

    let Some(handle) = find_account(&state, &query, &encrypt) else {
        return plain_text_response(StatusCode::UNAUTHORIZED, PROMPT_BAD_SIGNATURE.to_string());
    };

    let plaintext = match handle.bot_codec.decrypt(&encrypt) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("bot callback decrypt failed: {err:#}");
            return plain_text_response(StatusCode::BAD_REQUEST, PROMPT_BAD_ENVELOPE.to_string());
        }
    };

    let payload: Value = match serde_json::from_str(&plaintext) {
        Ok(value) => value,
        Err(_) => {
            return plain_text_response(StatusCode::BAD_REQUEST, "invalid callback json".to_string());
        }
    };

    let inbound = match parse_bot_inbound(payload) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("bot callback parse failed: {err}");
            return plain_text_response(StatusCode::BAD_REQUEST, "invalid callback".to_string());
        }
    };

    match inbound.msg_type.as_str() {
        "stream" => handle_stream_refresh(&state, handle, &query, &inbound),
        "event" => handle_event(&state, handle, &query, inbound),
        _ => handle_message(&state, handle, &query, inbound),
    }
}

/// Client poll for the current state of a reply slot.
fn handle_stream_refresh(
    state: &AppState,
    handle: &AccountHandle,
    query: &CallbackQuery,
    inbound: &BotInbound,
) -> Response {
    let stream_id = inbound
        .payload
        .get("stream")
        .and_then(|v| v.get("id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    if stream_id.is_empty() {
        return plain_text_response(StatusCode::BAD_REQUEST, "missing stream id".to_string());
    }
    encrypted_frame_reply(state, handle, query, stream_id, true)
}

fn handle_event(
    state: &AppState,
    handle: &AccountHandle,
    query: &CallbackQuery,
    inbound: BotInbound,
) -> Response {
    let event_type = inbound
        .payload
        .get("event")
        .and_then(|v| v.get("eventtype"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    match event_type.as_str() {
        "enter_chat" => {
            let welcome = handle
                .account
                .welcome_text
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty());
            match welcome {
                Some(text) => {
                    let payload = serde_json::json!({
                        "msgtype": "text",
                        "text": { "content": text },
                    });
                    encrypted_reply(handle, query, &payload.to_string())
                }
                None => encrypted_reply(handle, query, ""),
            }
        }
        "template_card_event" => handle_template_card_event(state, handle, query, inbound),
        _ => {
            tracing::info!(
                "bot event ignored: event_type={event_type} msg_id={}",
                inbound.msg_id
            );
            encrypted_reply(handle, query, "")
        }
    }
}

/// A card button press becomes a synthetic text message driven outside the
/// conversation queue: the card interaction already owns its reply slot.
fn handle_template_card_event(
    state: &AppState,
    handle: &AccountHandle,
    query: &CallbackQuery,
    inbound: BotInbound,
) -> Response {
    if !inbound.msg_id.is_empty() && state.store.stream_for_msg(&inbound.msg_id).is_some() {
        return encrypted_reply(handle, query, "");
    }

    let synthetic = template_card_event_text(&inbound.payload);
    let conversation_key = conversation_key(
        &handle.account.name,
        &inbound.user_id,
        inbound.chat_id.as_deref(),
    );
    let origin = BatchOrigin {
        account: Arc::clone(&handle.account),
        user_id: inbound.user_id.clone(),
        chat: inbound.chat,
        chat_id: inbound.chat_id.clone(),
        ai_agent_id: inbound.ai_agent_id.clone(),
        msg_type: "event".to_string(),
        payload: inbound.payload.clone(),
    };

    let batch_key = format!("{conversation_key}#card");
    let stream_id = state
        .store
        .create_stream(&conversation_key, &batch_key, &origin, None);
    state.store.mark_started(&stream_id);
    if !inbound.msg_id.is_empty() {
        state.store.map_msg(&inbound.msg_id, &stream_id);
    }
    if let Some(url) = inbound.response_url.as_deref() {
        state.store.store_reply_url(
            &stream_id,
            url,
            handle.account.network.effective_proxy().as_deref(),
        );
    }

    let batch = crate::gateway::store::PendingBatch::detached(
        batch_key,
        conversation_key,
        stream_id,
        origin,
        synthetic,
        inbound.msg_id.clone(),
    );
    let driver = Arc::clone(&state.driver);
    tokio::spawn(async move {
        driver.process_batch(batch).await;
    });

    encrypted_reply(handle, query, "")
}

fn template_card_event_text(payload: &Value) -> String {
    let event = payload.get("event").cloned().unwrap_or(Value::Null);
    let card = event.get("template_card_event").cloned().unwrap_or(Value::Null);
    let button = card
        .get("event_key")
        .or_else(|| card.get("eventkey"))
        .and_then(Value::as_str)
        .unwrap_or("-");
    let task = card
        .get("task_id")
        .or_else(|| card.get("taskid"))
        .and_then(Value::as_str)
        .unwrap_or("-");
    let selections = card
        .get("selected_items")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("[event] template_card_event button={button} selections={selections} task={task}")
}

/// An ordinary message: dedupe, admit into the queue, answer with the
/// placeholder frame for whichever stream now owns it.
fn handle_message(
    state: &AppState,
    handle: &AccountHandle,
    query: &CallbackQuery,
    inbound: BotInbound,
) -> Response {
    if !inbound.msg_id.is_empty() {
        if let Some(existing) = state.store.stream_for_msg(&inbound.msg_id) {
            tracing::debug!(
                "bot callback duplicate msg_id={} stream={existing}",
                inbound.msg_id
            );
            return encrypted_frame_reply(state, handle, query, &existing, false);
        }
    }

    let conversation_key = conversation_key(
        &handle.account.name,
        &inbound.user_id,
        inbound.chat_id.as_deref(),
    );
    let content = driver::build_inbound_body(&inbound.msg_type, &inbound.payload);
    let origin = BatchOrigin {
        account: Arc::clone(&handle.account),
        user_id: inbound.user_id.clone(),
        chat: inbound.chat,
        chat_id: inbound.chat_id.clone(),
        ai_agent_id: inbound.ai_agent_id.clone(),
        msg_type: inbound.msg_type.clone(),
        payload: inbound.payload.clone(),
    };

    let msg_id = (!inbound.msg_id.is_empty()).then(|| inbound.msg_id.clone());
    let admission = state.store.add_pending_message(
        &conversation_key,
        origin.clone(),
        content,
        msg_id,
        Duration::from_millis(handle.account.debounce_ms),
    );

    let proxy = handle.account.network.effective_proxy();
    if let Some(url) = inbound.response_url.as_deref() {
        state
            .store
            .store_reply_url(&admission.stream_id, url, proxy.as_deref());
    }

    let reply_stream_id = match admission.status {
        AdmissionStatus::ActiveNew => {
            state
                .store
                .set_stream_content(&admission.stream_id, &handle.account.stream_placeholder);
            admission.stream_id.clone()
        }
        AdmissionStatus::QueuedNew => {
            state
                .store
                .set_stream_content(&admission.stream_id, PROMPT_QUEUED);
            admission.stream_id.clone()
        }
        AdmissionStatus::ActiveMerged | AdmissionStatus::QueuedMerged => {
            // The merged message gets its own ack slot pointing the user at
            // the batch reply; its msg-id maps to the ack, never the batch.
            let batch_key = state
                .store
                .stream_snapshot(&admission.stream_id)
                .map(|s| s.batch_key)
                .unwrap_or_else(|| conversation_key.clone());
            let ack_stream_id = state.store.add_ack_stream_for_batch(
                &batch_key,
                &origin,
                &conversation_key,
                PROMPT_MERGED,
            );
            if !inbound.msg_id.is_empty() {
                state.store.map_msg(&inbound.msg_id, &ack_stream_id);
            }
            ack_stream_id
        }
    };

    encrypted_frame_reply(state, handle, query, &reply_stream_id, false)
}
