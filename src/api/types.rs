//! 管理与测试端点的请求/响应类型

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::{CodeMetrics, Complexity, Finding};
use crate::anthropic::Usage;
use crate::health::{ComponentHealth, OverallStatus};
use crate::logs::LogEntry;

// === 健康检查 ===

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: OverallStatus,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentHealth>,
    pub system: SystemInfo,
}

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_rss_bytes: Option<u64>,
    pub active_conversations: usize,
    pub queue_depth: usize,
    pub worker_count: usize,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub timestamp: DateTime<Utc>,
}

// === 配置快照 ===

/// 不含任何密钥的配置快照，密钥只以 `*_configured` 形式出现
#[derive(Debug, Serialize)]
pub struct ConfigSnapshot {
    pub version: &'static str,
    pub anthropic_model: String,
    pub anthropic_base_url: String,
    pub anthropic_max_tokens: u32,
    pub anthropic_temperature: f32,
    pub anthropic_timeout_secs: u64,
    pub anthropic_api_key_configured: bool,
    pub slack_bot_token_configured: bool,
    pub slack_signing_secret_configured: bool,
    pub admin_api_key_configured: bool,
    pub proxy_configured: bool,
    pub security_screening_configured: bool,
    pub general_chat_enabled: bool,
    pub max_retries: u32,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub rate_limit_per_minute: u32,
    pub signature_tolerance_secs: u64,
    pub health_check_timeout_secs: u64,
    pub context_max_turns: usize,
    pub context_ttl_secs: u64,
    pub log_level: String,
    pub log_buffer_size: usize,
    pub warehouse_backend: &'static str,
    pub supported_languages: &'static [&'static str],
    pub commands: Vec<&'static str>,
}

// === 日志 ===

/// `GET /logs` 查询参数（数值手动解析以返回统一错误格式）
#[derive(Debug, Default, Deserialize)]
pub struct LogsParams {
    pub level: Option<String>,
    pub limit: Option<String>,
    pub since: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub total: usize,
    pub entries: Vec<LogEntry>,
}

// === 测试端点 ===

#[derive(Debug, Deserialize)]
pub struct CodeGenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CodeGenerationResponse {
    pub code: String,
    pub language: String,
    pub explanation: String,
    pub estimated_complexity: Complexity,
    pub quality_score: u8,
    pub usage: Usage,
    pub latency_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct CodeAnalysisRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub use_ai: bool,
}

#[derive(Debug, Serialize)]
pub struct CodeAnalysisResponse {
    pub language: String,
    pub metrics: CodeMetrics,
    pub findings: Vec<Finding>,
    pub estimated_complexity: Complexity,
    pub quality_score: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_review: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}
