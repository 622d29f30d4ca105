//! Anthropic Messages API 适配层
//!
//! # 功能
//! - 构造请求（system prompt + 多轮消息）
//! - 提取文本响应、token 用量与耗时
//! - 有界重试（指数退避 + 抖动，尊重 retry-after）
//! - 熔断（连续失败后快速失败，冷却后单次试探）

mod circuit;
mod client;
mod retry;
pub mod types;

pub use circuit::{CircuitBreaker, CircuitState};
pub use client::AnthropicClient;
pub use retry::RetryPolicy;
pub use types::{ChatMessage, Completion, CompletionRequest, Usage};

use std::time::Duration;

use async_trait::async_trait;

/// AI 调用错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum AiError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream returned no text content")]
    EmptyResponse,

    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    #[error("circuit open, upstream temporarily unavailable")]
    CircuitOpen,
}

impl AiError {
    /// 是否值得重试：429、5xx（含 529 overloaded）、超时与网络错误
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status >= 500,
            Self::RateLimited { .. } | Self::Timeout | Self::Network(_) => true,
            Self::EmptyResponse | Self::Decode(_) | Self::CircuitOpen => false,
        }
    }

    /// 是否计入熔断失败次数
    ///
    /// 调用方自身的 4xx 不代表上游故障
    pub fn trips_breaker(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status >= 500,
            Self::CircuitOpen => false,
            _ => true,
        }
    }

    /// 指标与日志使用的简短类别名
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout => "timeout",
            Self::Network(_) => "network",
            Self::EmptyResponse => "empty_response",
            Self::Decode(_) => "decode",
            Self::CircuitOpen => "circuit_open",
        }
    }

    /// 面向聊天用户的提示文本
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => {
                "The AI service is busy right now. Please try again in a minute."
            }
            Self::Timeout => "The AI service took too long to respond. Please try again.",
            Self::CircuitOpen => {
                "The AI service is temporarily unavailable. Please try again in a few minutes."
            }
            _ => "Sorry, something went wrong while talking to the AI service. Please try again.",
        }
    }
}

/// 文本补全客户端
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// 发送一次补全请求
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, AiError>;

    /// 健康探测
    async fn ping(&self) -> Result<(), AiError>;

    /// 当前使用的模型 ID
    fn model(&self) -> &str;
}
