//! Interface to the agent runtime. The runtime itself — model invocation,
//! session persistence, command policy — lives in the embedding application;
//! the gateway only depends on this seam.

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Direct,
    Group,
}

impl ChatKind {
    pub fn is_group(self) -> bool {
        matches!(self, ChatKind::Group)
    }
}

/// Where a batch of inbound messages should be dispatched.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub agent_id: String,
    pub session_key: String,
    pub account_id: String,
}

/// A media file persisted through the runtime's sink.
#[derive(Debug, Clone)]
pub struct SavedMedia {
    pub path: PathBuf,
    pub url: Option<String>,
}

/// One streamed delivery event from the agent.
#[derive(Debug, Clone, Default)]
pub struct AgentBlock {
    pub text: String,
    pub media_url: Option<String>,
    pub media_urls: Vec<String>,
}

impl AgentBlock {
    /// All media references of the block, single-url form included.
    pub fn all_media(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        if let Some(single) = self.media_url.as_deref() {
            out.push(single.to_string());
        }
        for url in &self.media_urls {
            if !out.iter().any(|existing| existing == url) {
                out.push(url.clone());
            }
        }
        out
    }
}

/// Verdict of the command-authorization policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandVerdict {
    NotCommand,
    Allowed,
    Denied,
}

/// The normalized inbound contract handed to the runtime.
#[derive(Debug, Clone)]
pub struct InboundContext {
    /// Human-readable envelope body (header lines + raw content).
    pub body: String,
    /// The user's raw content without the envelope header.
    pub raw_body: String,
    /// Raw body when it parses as a slash command.
    pub command_body: Option<String>,
    pub source: String,
    pub target: String,
    pub session_key: String,
    pub chat: ChatKind,
    /// Provider tag; always "wecom" for this gateway.
    pub provider: &'static str,
    /// Surface tag: "bot" or "application".
    pub surface: &'static str,
    pub command_authorized: bool,
    pub media_path: Option<PathBuf>,
    pub media_kind: Option<String>,
    pub media_url: Option<String>,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Resolve an inbound (account, user, chat) triple to a dispatch route.
    async fn resolve_route(
        &self,
        account: &str,
        user_id: &str,
        chat_id: Option<&str>,
    ) -> Result<RouteInfo>;

    /// Evaluate the command policy for the context. The gateway enforces the
    /// verdict; the policy itself is the runtime's.
    fn authorize_command(&self, ctx: &InboundContext) -> CommandVerdict;

    /// Persist a media blob through the runtime's sink.
    async fn save_media(&self, bytes: &[u8], file_name: &str, mime: &str) -> Result<SavedMedia>;

    /// Fetch a remote media URL on the runtime's network policy.
    async fn fetch_remote_media(&self, url: &str) -> Result<Vec<u8>>;

    /// Record the inbound turn in the runtime's session store.
    async fn record_inbound(&self, ctx: &InboundContext) -> Result<()>;

    /// Force a tool onto the runtime's sandbox deny-list for this dispatch.
    fn deny_sandbox_tool(&self, tool: &str);

    /// Dispatch the context to the agent. Output arrives as a stream of
    /// blocks; the channel closing marks the end of the reply.
    async fn dispatch(&self, ctx: InboundContext) -> Result<mpsc::Receiver<AgentBlock>>;
}
