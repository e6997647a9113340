use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ResolvedAccount;
use crate::outbound::http;

/// Tokens are considered stale once expiry is closer than this margin.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const TOKEN_DEFAULT_TTL_SECS: u64 = 7_200;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Default)]
struct TokenSlot {
    token: String,
    expires_at: Option<Instant>,
}

impl TokenSlot {
    fn fresh(&self) -> Option<String> {
        let expires_at = self.expires_at?;
        if self.token.is_empty() {
            return None;
        }
        if expires_at.checked_duration_since(Instant::now())? > TOKEN_EXPIRY_MARGIN {
            Some(self.token.clone())
        } else {
            None
        }
    }
}

/// Per-(corp_id, agent_id) access-token cache with single-flight refresh.
///
/// Each key owns an async mutex around its slot; the holder of that mutex is
/// the one in-flight refresh, and every concurrent getter awaits it. A failed
/// refresh releases the slot untouched so the next caller retries.
pub struct TokenCache {
    api_base: String,
    slots: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<TokenSlot>>>>,
}

impl TokenCache {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, account: &ResolvedAccount) -> Result<String> {
        let slot = self.slot(account);
        let mut guard = slot.lock().await;
        if let Some(token) = guard.fresh() {
            return Ok(token);
        }

        let (token, ttl) = self.refresh(account).await?;
        guard.token = token.clone();
        guard.expires_at = Some(Instant::now() + Duration::from_secs(ttl));
        Ok(token)
    }

    /// Drop any cached token for the account, forcing the next `get` to refresh.
    pub fn invalidate(&self, account: &ResolvedAccount) {
        self.slots
            .lock()
            .remove(&(account.corp_id.clone(), account.agent_id.clone()));
    }

    fn slot(&self, account: &ResolvedAccount) -> Arc<tokio::sync::Mutex<TokenSlot>> {
        let key = (account.corp_id.clone(), account.agent_id.clone());
        self.slots.lock().entry(key).or_default().clone()
    }

    async fn refresh(&self, account: &ResolvedAccount) -> Result<(String, u64)> {
        let client = http::client_for(&account.network)?;
        let url = format!("{}/gettoken", self.api_base);
        let response = client
            .get(&url)
            .query(&[
                ("corpid", account.corp_id.as_str()),
                ("corpsecret", account.app_secret.as_str()),
            ])
            .timeout(http::request_timeout(&account.network))
            .send()
            .await
            .context("gettoken request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("gettoken failed: status={status} body={body}");
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .context("gettoken response is not json")?;
        let token = parsed
            .access_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "gettoken failed: errcode={} errmsg={}",
                    parsed.errcode,
                    parsed.errmsg
                )
            })?;
        let ttl = parsed.expires_in.unwrap_or(TOKEN_DEFAULT_TTL_SECS);
        tracing::debug!(
            "access token refreshed for corp={} agent={} ttl={ttl}s",
            account.corp_id,
            account.agent_id
        );
        Ok((token, ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_requires_margin() {
        let mut slot = TokenSlot {
            token: "t".to_string(),
            expires_at: Some(Instant::now() + Duration::from_secs(120)),
        };
        assert_eq!(slot.fresh().as_deref(), Some("t"));

        slot.expires_at = Some(Instant::now() + Duration::from_secs(30));
        assert!(slot.fresh().is_none(), "inside the 60s margin is stale");

        slot.expires_at = None;
        assert!(slot.fresh().is_none());
    }

    #[test]
    fn empty_token_is_never_fresh() {
        let slot = TokenSlot {
            token: String::new(),
            expires_at: Some(Instant::now() + Duration::from_secs(7_200)),
        };
        assert!(slot.fresh().is_none());
    }

    #[test]
    fn token_response_parses_success_and_error() {
        let ok: TokenResponse = serde_json::from_str(
            r#"{"errcode":0,"errmsg":"ok","access_token":"abc","expires_in":7200}"#,
        )
        .unwrap();
        assert_eq!(ok.access_token.as_deref(), Some("abc"));
        assert_eq!(ok.expires_in, Some(7200));

        let err: TokenResponse =
            serde_json::from_str(r#"{"errcode":40013,"errmsg":"invalid corpid"}"#).unwrap();
        assert!(err.access_token.is_none());
        assert_eq!(err.errcode, 40013);
    }
}
