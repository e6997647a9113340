//! Outbound side of the gateway: token-gated WeCom API calls, the shared
//! HTTP fetch helpers, and target-string resolution.

pub mod api;
pub mod http;
pub mod target;
pub mod token;
