//! wecom-bridge: a dual-mode WeCom messaging gateway.
//!
//! WeCom exposes two incompatible inbound channels — a JSON "bot" channel
//! whose replies are passive stream slots the client polls, and an XML
//! "application" channel whose replies go out through authenticated API
//! calls. This crate accepts encrypted webhooks from both, coalesces
//! rapid-fire user messages into debounced batches, drives an agent runtime
//! per batch, and delivers the streamed answer back over whichever channel
//! can still carry it, falling back from the bot stream to application
//! direct messages for files and long-running tasks.
//!
//! The agent runtime itself, session persistence and configuration loading
//! are collaborators behind the [`agent::AgentRuntime`] trait; this crate
//! owns the reception and delivery fabric only.

pub mod agent;
pub mod config;
pub mod gateway;
pub mod outbound;
