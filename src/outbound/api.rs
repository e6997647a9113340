use anyhow::{Context, Result};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::ResolvedAccount;
use crate::outbound::http;
use crate::outbound::target::SendTarget;
use crate::outbound::token::TokenCache;

pub const API_BASE: &str = "https://qyapi.weixin.qq.com/cgi-bin";

const GROUP_CHAT_REFUSAL: &str =
    "暂不支持向群聊会话主动发送消息，请改用群内机器人回复或私信接收。";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Voice,
    Video,
    File,
}

impl MediaKind {
    /// Classify an outbound attachment by file name.
    pub fn for_file_name(name: &str) -> Self {
        let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" => MediaKind::Image,
            "amr" => MediaKind::Voice,
            "mp4" => MediaKind::Video,
            _ => MediaKind::File,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Voice => "voice",
            MediaKind::Video => "video",
            MediaKind::File => "file",
        }
    }
}

#[derive(Debug)]
pub struct DownloadedMedia {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
}

/// Token-aware client for WeCom's active APIs.
pub struct WeComApi {
    base: String,
    tokens: Arc<TokenCache>,
}

impl WeComApi {
    pub fn new(tokens: Arc<TokenCache>) -> Self {
        Self::with_base(API_BASE, tokens)
    }

    pub fn with_base(base: impl Into<String>, tokens: Arc<TokenCache>) -> Self {
        Self {
            base: base.into(),
            tokens,
        }
    }

    /// Send a plain text message. Chat targets are refused: the appchat
    /// endpoint is unreliable for this workload and the bot channel already
    /// covers in-group replies.
    pub async fn send_text(
        &self,
        account: &ResolvedAccount,
        target: &SendTarget,
        content: &str,
    ) -> Result<()> {
        let mut payload = json!({
            "msgtype": "text",
            "agentid": agent_id_number(account)?,
            "text": { "content": content },
        });
        apply_target(&mut payload, target)?;
        self.post_message(account, "message/send", &payload).await
    }

    /// Send an already-uploaded media item.
    pub async fn send_media(
        &self,
        account: &ResolvedAccount,
        target: &SendTarget,
        kind: MediaKind,
        media_id: &str,
    ) -> Result<()> {
        let body = match kind {
            MediaKind::Video => json!({
                "media_id": media_id,
                "title": "Video",
                "description": "",
            }),
            _ => json!({ "media_id": media_id }),
        };
        let mut payload = json!({
            "msgtype": kind.as_str(),
            "agentid": agent_id_number(account)?,
        });
        payload[kind.as_str()] = body;
        apply_target(&mut payload, target)?;
        self.post_message(account, "message/send", &payload).await
    }

    /// Upload a temporary media blob and return its media id. The multipart
    /// body is built by hand: WeCom wants `filelength` inside the
    /// Content-Disposition, which reqwest's multipart support cannot express.
    pub async fn upload_media(
        &self,
        account: &ResolvedAccount,
        kind: MediaKind,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let token = self.tokens.get(account).await?;
        let boundary = format!("wecom-bridge-{}", random_boundary());
        let body = build_multipart_body(&boundary, file_name, &bytes);

        let client = http::client_for(&account.network)?;
        let url = format!(
            "{}/media/upload?access_token={}&type={}&debug=1",
            self.base,
            token,
            kind.as_str()
        );
        let response = client
            .post(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(body)
            .timeout(http::request_timeout(&account.network))
            .send()
            .await
            .context("media upload request failed")?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("media upload failed: status={status} body={text}");
        }
        let parsed: Value = serde_json::from_str(&text).context("media upload response is not json")?;
        check_errcode(&parsed)?;
        parsed
            .get("media_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
            .ok_or_else(|| anyhow::anyhow!("media upload response missing media_id"))
    }

    /// Fetch a media blob by id. JSON bodies are API errors; binary bodies
    /// come back with their content type and any Content-Disposition name.
    pub async fn download_media(
        &self,
        account: &ResolvedAccount,
        media_id: &str,
    ) -> Result<DownloadedMedia> {
        let token = self.tokens.get(account).await?;
        let client = http::client_for(&account.network)?;
        let url = format!("{}/media/get", self.base);
        let response = client
            .get(&url)
            .query(&[("access_token", token.as_str()), ("media_id", media_id)])
            .timeout(http::request_timeout(&account.network))
            .send()
            .await
            .context("media download request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("media download failed: status={status} body={body}");
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        let file_name = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_disposition_filename);

        let bytes =
            http::read_body_capped(response, account.network.media_max_bytes).await?;

        if looks_like_json_error(content_type.as_deref(), &bytes) {
            let parsed: Value =
                serde_json::from_slice(&bytes).context("media error body is not json")?;
            check_errcode(&parsed)?;
            anyhow::bail!("media download returned json without errcode");
        }

        Ok(DownloadedMedia {
            bytes,
            content_type,
            file_name,
        })
    }

    async fn post_message(
        &self,
        account: &ResolvedAccount,
        path: &str,
        payload: &Value,
    ) -> Result<()> {
        let token = self.tokens.get(account).await?;
        let client = http::client_for(&account.network)?;
        let url = format!("{}/{}", self.base, path);
        let response = client
            .post(&url)
            .query(&[("access_token", token.as_str())])
            .json(payload)
            .timeout(http::request_timeout(&account.network))
            .send()
            .await
            .with_context(|| format!("{path} request failed"))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("{path} failed: status={status} body={text}");
        }
        let parsed: Value =
            serde_json::from_str(&text).with_context(|| format!("{path} response is not json"))?;
        check_errcode(&parsed)?;
        check_partial_failure(&parsed)?;
        Ok(())
    }
}

fn agent_id_number(account: &ResolvedAccount) -> Result<i64> {
    account
        .agent_id
        .trim()
        .parse::<i64>()
        .context("agent_id must be an integer")
}

fn apply_target(payload: &mut Value, target: &SendTarget) -> Result<()> {
    let Some(map) = payload.as_object_mut() else {
        anyhow::bail!("message payload must be a json object");
    };
    match target {
        SendTarget::User(id) => {
            map.insert("touser".to_string(), Value::String(id.clone()));
        }
        SendTarget::Party(id) => {
            map.insert("toparty".to_string(), Value::String(id.clone()));
        }
        SendTarget::Tag(id) => {
            map.insert("totag".to_string(), Value::String(id.clone()));
        }
        SendTarget::Chat(_) => anyhow::bail!("{GROUP_CHAT_REFUSAL}"),
    }
    Ok(())
}

/// Validate a business JSON body from a webhook-style push endpoint.
pub(crate) fn check_business_body(body: &str) -> Result<()> {
    let parsed: Value = serde_json::from_str(body).context("push response is not json")?;
    check_errcode(&parsed)
}

fn check_errcode(parsed: &Value) -> Result<()> {
    let errcode = parsed.get("errcode").and_then(Value::as_i64).unwrap_or(-1);
    if errcode != 0 {
        let errmsg = parsed
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        anyhow::bail!("errcode={errcode} errmsg={errmsg}");
    }
    Ok(())
}

/// A zero errcode can still hide rejected recipients.
fn check_partial_failure(parsed: &Value) -> Result<()> {
    let mut rejected = Vec::new();
    for key in ["invaliduser", "invalidparty", "invalidtag"] {
        if let Some(list) = parsed.get(key).and_then(Value::as_str) {
            if !list.trim().is_empty() {
                rejected.push(format!("{key}={list}"));
            }
        }
    }
    if rejected.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("partial send failure: {}", rejected.join(" "))
    }
}

pub fn content_type_for_extension(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "jpg" => "image/jpg",
        "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "amr" => "voice/amr",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

fn build_multipart_body(boundary: &str, file_name: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 512);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"media\"; filename=\"{}\"; filelength={}\r\n",
            file_name,
            bytes.len()
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!("Content-Type: {}\r\n\r\n", content_type_for_extension(file_name)).as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

fn random_boundary() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

fn looks_like_json_error(content_type: Option<&str>, bytes: &[u8]) -> bool {
    if let Some(ct) = content_type {
        if ct.to_ascii_lowercase().contains("application/json") {
            return true;
        }
    }
    let head = bytes.iter().find(|b| !b.is_ascii_whitespace());
    head == Some(&b'{') && serde_json::from_slice::<Value>(bytes).is_ok()
}

/// Parse a filename out of a Content-Disposition header, handling both the
/// plain `filename=` form and RFC 5987 `filename*=UTF-8''...`.
pub fn parse_disposition_filename(header: &str) -> Option<String> {
    for part in header.split(';') {
        let part = part.trim();
        if let Some(rest) = strip_prefix_ignore_case(part, "filename*=") {
            let rest = rest.trim();
            let encoded = rest
                .strip_prefix("UTF-8''")
                .or_else(|| strip_prefix_ignore_case(rest, "utf-8''"))
                .unwrap_or(rest);
            let decoded = percent_decode(encoded);
            if !decoded.is_empty() {
                return Some(decoded);
            }
        }
    }
    for part in header.split(';') {
        let part = part.trim();
        if let Some(rest) = strip_prefix_ignore_case(part, "filename=") {
            let name = rest.trim().trim_matches('"').trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    if input.len() >= prefix.len() && input[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&input[prefix.len()..])
    } else {
        None
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_map_matches_platform_expectations() {
        assert_eq!(content_type_for_extension("a.jpg"), "image/jpg");
        assert_eq!(content_type_for_extension("a.JPEG"), "image/jpeg");
        assert_eq!(content_type_for_extension("a.png"), "image/png");
        assert_eq!(content_type_for_extension("a.gif"), "image/gif");
        assert_eq!(content_type_for_extension("a.bmp"), "image/bmp");
        assert_eq!(content_type_for_extension("a.amr"), "voice/amr");
        assert_eq!(content_type_for_extension("a.mp4"), "video/mp4");
        assert_eq!(content_type_for_extension("a.pdf"), "application/octet-stream");
        assert_eq!(content_type_for_extension("noext"), "application/octet-stream");
    }

    #[test]
    fn multipart_body_carries_filelength() {
        let body = build_multipart_body("bound1", "report.pdf", b"hello");
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("--bound1\r\n"));
        assert!(text.contains("name=\"media\""));
        assert!(text.contains("filename=\"report.pdf\""));
        assert!(text.contains("filelength=5"));
        assert!(text.contains("Content-Type: application/octet-stream"));
        assert!(text.contains("hello"));
        assert!(text.ends_with("--bound1--\r\n"));
    }

    #[test]
    fn errcode_and_partial_failures() {
        assert!(check_errcode(&serde_json::json!({"errcode": 0})).is_ok());
        assert!(check_errcode(&serde_json::json!({"errcode": 60011, "errmsg": "no privilege"}))
            .is_err());
        assert!(check_errcode(&serde_json::json!({"errmsg": "missing"})).is_err());

        assert!(check_partial_failure(&serde_json::json!({"errcode": 0})).is_ok());
        let partial = serde_json::json!({"errcode": 0, "invaliduser": "u1|u2"});
        let err = check_partial_failure(&partial).unwrap_err();
        assert!(err.to_string().contains("invaliduser=u1|u2"));
        assert!(
            check_partial_failure(&serde_json::json!({"errcode": 0, "invalidtag": " "})).is_ok()
        );
    }

    #[test]
    fn chat_targets_are_refused() {
        let mut payload = serde_json::json!({"msgtype": "text"});
        let err = apply_target(&mut payload, &SendTarget::Chat("wr1".into())).unwrap_err();
        assert!(err.to_string().contains("群聊"));
        assert!(apply_target(&mut payload, &SendTarget::User("u1".into())).is_ok());
        assert_eq!(payload["touser"], "u1");
    }

    #[test]
    fn disposition_filename_plain_and_rfc5987() {
        assert_eq!(
            parse_disposition_filename(r#"attachment; filename="report.pdf""#).as_deref(),
            Some("report.pdf")
        );
        assert_eq!(
            parse_disposition_filename("attachment; filename=plain.txt").as_deref(),
            Some("plain.txt")
        );
        assert_eq!(
            parse_disposition_filename(
                "attachment; filename*=UTF-8''%E6%8A%A5%E5%91%8A.pdf; filename=\"fallback.pdf\""
            )
            .as_deref(),
            Some("报告.pdf")
        );
        assert_eq!(parse_disposition_filename("inline"), None);
    }

    #[test]
    fn json_error_detection() {
        assert!(looks_like_json_error(
            Some("application/json; charset=utf-8"),
            b"{}"
        ));
        assert!(looks_like_json_error(None, br#"  {"errcode":40007}"#));
        assert!(!looks_like_json_error(Some("image/png"), b"\x89PNG\r\n"));
        assert!(!looks_like_json_error(None, b"{not json"));
    }
}
