//! Anthropic HTTP 客户端

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};

use super::types::{MessagesRequest, MessagesResponse, UpstreamError};
use super::{AiError, CircuitBreaker, Completion, CompletionClient, CompletionRequest, RetryPolicy};
use crate::common::{log_preview, truncate_with_ellipsis};
use crate::http_client::build_client;
use crate::model::config::Config;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API 客户端
pub struct AnthropicClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl AnthropicClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let api_key = config
            .anthropic_api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("ANTHROPIC_API_KEY 未配置"))?;
        let client = build_client(config.proxy_url.as_deref(), config.anthropic_timeout_secs)?;

        Ok(Self {
            client,
            base_url: config.anthropic_base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.anthropic_model.clone(),
            max_tokens: config.anthropic_max_tokens,
            temperature: config.anthropic_temperature,
            retry: RetryPolicy::with_max_attempts(config.max_retries),
            breaker: Arc::new(CircuitBreaker::default()),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn send_once(&self, body: &MessagesRequest<'_>) -> Result<MessagesResponse, AiError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let response = check_status(response).await?;
        let text = response.text().await.map_err(map_transport_error)?;
        serde_json::from_str(&text).map_err(|e| AiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, AiError> {
        let permit = self.breaker.try_acquire()?;

        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            temperature: request.temperature.unwrap_or(self.temperature),
            system: &request.system,
            messages: &request.messages,
        };

        tracing::debug!(
            model = %self.model,
            messages = request.messages.len(),
            "发送 AI 请求: {}",
            request
                .messages
                .last()
                .map(|m| log_preview(&m.content))
                .unwrap_or_default()
        );

        let start = Instant::now();
        let result = self.retry.run(|_| self.send_once(&body)).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let result = result.and_then(|resp| {
            let text = resp.text();
            if text.trim().is_empty() {
                return Err(AiError::EmptyResponse);
            }
            Ok(Completion {
                text,
                usage: resp.usage,
                latency_ms,
                model: if resp.model.is_empty() {
                    self.model.clone()
                } else {
                    resp.model
                },
                stop_reason: resp.stop_reason,
            })
        });
        permit.record(&result);

        match &result {
            Ok(completion) => tracing::info!(
                input_tokens = completion.usage.input_tokens,
                output_tokens = completion.usage.output_tokens,
                latency_ms,
                "AI 请求完成: {}",
                log_preview(&completion.text)
            ),
            Err(e) => tracing::warn!(latency_ms, kind = e.kind(), "AI 请求失败: {}", e),
        }
        result
    }

    async fn ping(&self) -> Result<(), AiError> {
        let url = format!("{}/v1/models?limit=1", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response).await.map(|_| ())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn map_transport_error(e: reqwest::Error) -> AiError {
    if e.is_timeout() {
        AiError::Timeout
    } else if e.is_decode() {
        AiError::Decode(e.to_string())
    } else {
        AiError::Network(e.to_string())
    }
}

/// 非 2xx 响应转换为 [`AiError`]
async fn check_status(response: Response) -> Result<Response, AiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(AiError::RateLimited { retry_after });
    }

    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<UpstreamError>(&body) {
        Ok(err) if !err.error.message.is_empty() => {
            format!("{}: {}", err.error.error_type, err.error.message)
        }
        _ => truncate_with_ellipsis(&body, 300),
    };
    Err(AiError::Http {
        status: status.as_u16(),
        message,
    })
}
