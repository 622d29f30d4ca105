use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// 持久化后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum WarehouseBackend {
    /// 不持久化
    None,
    /// 本地 SQLite 文件
    Sqlite,
    /// Google BigQuery（REST 流式插入）
    BigQuery,
}

impl Default for WarehouseBackend {
    fn default() -> Self {
        Self::None
    }
}

impl FromStr for WarehouseBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "disabled" => Ok(Self::None),
            "sqlite" => Ok(Self::Sqlite),
            "bigquery" => Ok(Self::BigQuery),
            other => anyhow::bail!("未知的 WAREHOUSE_BACKEND: {}", other),
        }
    }
}

impl TryFrom<String> for WarehouseBackend {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl WarehouseBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Sqlite => "sqlite",
            Self::BigQuery => "bigquery",
        }
    }
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Text
    }
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("未知的 LOG_FORMAT: {}", other),
        }
    }
}

impl TryFrom<String> for LogFormat {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// 应用配置
///
/// 全部来自进程环境变量（启动时可先加载 `.env` 文件），
/// 变量名即字段名的大写形式，如 `ANTHROPIC_MODEL` → `anthropic_model`
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "webhook_host", default = "default_host")]
    pub host: String,

    #[serde(rename = "webhook_port", default = "default_port")]
    pub port: u16,

    /// Anthropic API 密钥（必填）
    #[serde(default)]
    pub anthropic_api_key: Option<String>,

    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,

    #[serde(default = "default_anthropic_base_url")]
    pub anthropic_base_url: String,

    #[serde(default = "default_anthropic_max_tokens")]
    pub anthropic_max_tokens: u32,

    #[serde(default = "default_anthropic_temperature")]
    pub anthropic_temperature: f32,

    #[serde(default = "default_anthropic_timeout_secs")]
    pub anthropic_timeout_secs: u64,

    /// Slack Bot Token（必填，xoxb- 开头）
    #[serde(default)]
    pub slack_bot_token: Option<String>,

    /// Slack 签名密钥（必填）
    #[serde(default)]
    pub slack_signing_secret: Option<String>,

    #[serde(default = "default_slack_api_base_url")]
    pub slack_api_base_url: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// `/logs` 端点保留的最近日志条数
    #[serde(default = "default_log_buffer_size")]
    pub log_buffer_size: usize,

    /// AI 请求最大尝试次数（含首次）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// 后台并发处理事件的 worker 数
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// 事件队列容量
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// 每用户每分钟请求上限（0 表示不限制）
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    /// 签名时间戳容忍窗口（秒）
    #[serde(default = "default_signature_tolerance_secs")]
    pub signature_tolerance_secs: u64,

    /// 依赖健康检查超时（秒）
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,

    /// 对话上下文保留的轮数
    #[serde(default = "default_context_max_turns")]
    pub context_max_turns: usize,

    /// 对话上下文过期时间（秒）
    #[serde(default = "default_context_ttl_secs")]
    pub context_ttl_secs: u64,

    /// 非命令文本是否作为普通提问转发给 AI
    #[serde(default)]
    pub general_chat_enabled: bool,

    /// Admin API 密钥（可选，配置后保护 /config、/logs、/test/*）
    #[serde(default)]
    pub admin_api_key: Option<String>,

    /// HTTP 代理地址（可选）
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// 安全预检服务地址（可选，未配置时不做预检）
    #[serde(default)]
    pub security_validator_url: Option<String>,

    #[serde(default)]
    pub security_validator_token: Option<String>,

    #[serde(default = "default_security_validator_timeout_secs")]
    pub security_validator_timeout_secs: u64,

    #[serde(default)]
    pub warehouse_backend: WarehouseBackend,

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    #[serde(default)]
    pub bigquery_project_id: Option<String>,

    #[serde(default)]
    pub bigquery_dataset: Option<String>,

    #[serde(default = "default_bigquery_location")]
    pub bigquery_location: String,

    /// 服务账号 JSON（整段内容）
    #[serde(rename = "google_application_credentials_json", default)]
    pub google_credentials_json: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_anthropic_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_anthropic_max_tokens() -> u32 {
    2000
}

fn default_anthropic_temperature() -> f32 {
    0.7
}

fn default_anthropic_timeout_secs() -> u64 {
    60
}

fn default_slack_api_base_url() -> String {
    "https://slack.com/api".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_buffer_size() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_rate_limit_per_minute() -> u32 {
    20
}

fn default_signature_tolerance_secs() -> u64 {
    300
}

fn default_health_check_timeout_secs() -> u64 {
    5
}

fn default_context_max_turns() -> usize {
    5
}

fn default_context_ttl_secs() -> u64 {
    3600
}

fn default_security_validator_timeout_secs() -> u64 {
    10
}

fn default_sqlite_path() -> String {
    "agent_history.db".to_string()
}

fn default_bigquery_location() -> String {
    "us-central1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            anthropic_api_key: None,
            anthropic_model: default_anthropic_model(),
            anthropic_base_url: default_anthropic_base_url(),
            anthropic_max_tokens: default_anthropic_max_tokens(),
            anthropic_temperature: default_anthropic_temperature(),
            anthropic_timeout_secs: default_anthropic_timeout_secs(),
            slack_bot_token: None,
            slack_signing_secret: None,
            slack_api_base_url: default_slack_api_base_url(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_buffer_size: default_log_buffer_size(),
            max_retries: default_max_retries(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            signature_tolerance_secs: default_signature_tolerance_secs(),
            health_check_timeout_secs: default_health_check_timeout_secs(),
            context_max_turns: default_context_max_turns(),
            context_ttl_secs: default_context_ttl_secs(),
            general_chat_enabled: false,
            admin_api_key: None,
            proxy_url: None,
            security_validator_url: None,
            security_validator_token: None,
            security_validator_timeout_secs: default_security_validator_timeout_secs(),
            warehouse_backend: WarehouseBackend::default(),
            sqlite_path: default_sqlite_path(),
            bigquery_project_id: None,
            bigquery_dataset: None,
            bigquery_location: default_bigquery_location(),
            google_credentials_json: None,
        }
    }
}

impl Config {
    /// 从进程环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_source(None)
    }

    /// `source` 为 `None` 时读取进程环境，否则只读取给定的变量表
    ///
    /// 空值视为未配置
    fn from_source(source: Option<config::Map<String, String>>) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .ignore_empty(true)
                    .source(source),
            )
            .build()
            .context("读取环境变量失败")?;

        let config: Config = settings
            .try_deserialize()
            .context("环境变量配置无效")?;
        Ok(config.normalized())
    }

    /// 去除首尾空白，仅含空白的可选值视为未配置
    fn normalized(mut self) -> Self {
        for value in [
            &mut self.anthropic_api_key,
            &mut self.slack_bot_token,
            &mut self.slack_signing_secret,
            &mut self.admin_api_key,
            &mut self.proxy_url,
            &mut self.security_validator_url,
            &mut self.security_validator_token,
            &mut self.bigquery_project_id,
            &mut self.bigquery_dataset,
            &mut self.google_credentials_json,
        ] {
            *value = value
                .take()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
        }
        self.anthropic_base_url = self.anthropic_base_url.trim().trim_end_matches('/').to_string();
        self.slack_api_base_url = self.slack_api_base_url.trim().trim_end_matches('/').to_string();
        self.log_level = self.log_level.trim().to_ascii_lowercase();
        self
    }

    /// 监听地址
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 是否启用持久化
    pub fn warehouse_enabled(&self) -> bool {
        self.warehouse_backend != WarehouseBackend::None
    }
}
