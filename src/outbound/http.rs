use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use crate::config::NetworkOptions;

/// One client per egress proxy URL; the empty key is the direct client.
fn client_cache() -> &'static Mutex<HashMap<String, reqwest::Client>> {
    static CACHE: OnceLock<Mutex<HashMap<String, reqwest::Client>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Build (or reuse) a client for the account's effective proxy. Timeouts are
/// applied per request so one cached client serves every caller.
pub fn client_for(network: &NetworkOptions) -> Result<reqwest::Client> {
    let proxy = network.effective_proxy().unwrap_or_default();

    if let Some(existing) = client_cache().lock().get(&proxy) {
        return Ok(existing.clone());
    }

    let mut builder = reqwest::Client::builder();
    if !proxy.is_empty() {
        builder = builder.proxy(reqwest::Proxy::all(&proxy).context("invalid egress proxy url")?);
    }
    let client = builder.build().context("failed to build http client")?;
    client_cache()
        .lock()
        .entry(proxy)
        .or_insert_with(|| client.clone());
    Ok(client)
}

pub fn request_timeout(network: &NetworkOptions) -> Duration {
    Duration::from_secs(network.http_timeout_secs.max(1))
}

/// Read a response body in chunks, aborting once `cap` bytes are exceeded.
pub async fn read_body_capped(response: reqwest::Response, cap: u64) -> Result<Vec<u8>> {
    if let Some(len) = response.content_length() {
        if len > cap {
            anyhow::bail!("response body too large: {len} bytes exceeds cap of {cap}");
        }
    }

    let mut out: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("failed to read response body")?;
        if out.len() as u64 + chunk.len() as u64 > cap {
            anyhow::bail!(
                "response body too large: exceeded cap of {cap} bytes mid-stream"
            );
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clients_are_cached_per_proxy() {
        let direct = NetworkOptions::default();
        let a = client_for(&direct).unwrap();
        let b = client_for(&direct).unwrap();
        // reqwest::Client is a cheap Arc handle; same cache slot either way.
        drop((a, b));
        assert!(client_cache().lock().contains_key(""));
    }

    #[test]
    fn timeout_floor_is_one_second() {
        let mut network = NetworkOptions::default();
        network.http_timeout_secs = 0;
        assert_eq!(request_timeout(&network), Duration::from_secs(1));
    }
}
