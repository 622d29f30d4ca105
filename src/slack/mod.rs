//! Slack 接入
//!
//! - `signature`：请求签名校验
//! - `handlers` / `router`：Events API 与 slash command 入口
//! - `client`：Web API 出站调用
//! - `splitter`：长消息拆分

pub mod client;
pub mod dedupe;
mod handlers;
mod router;
pub mod signature;
pub mod splitter;
pub mod types;

pub use client::{BotIdentity, ChatPoster, SlackApiClient};
pub use dedupe::EventDeduper;
pub use router::{SlackState, create_slack_router};
pub use signature::SignatureVerifier;
pub use splitter::MessageSplitter;

/// Slack Web API 错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum SlackError {
    #[error("Slack HTTP {0}")]
    Http(u16),

    #[error("Slack API error: {0}")]
    Api(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("decode error: {0}")]
    Decode(String),
}
