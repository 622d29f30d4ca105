//! 启动配置校验
//!
//! 收集所有问题后一次性报告，`--check-config` 直接打印该报告

use serde::Serialize;

use super::config::{Config, WarehouseBackend};

/// 校验报告
#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    /// 缺失的必填变量
    pub missing_required: Vec<String>,
    /// 格式或取值非法的变量
    pub invalid_values: Vec<String>,
    /// 不影响启动的提示
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.missing_required.is_empty() && self.invalid_values.is_empty()
    }

    /// 人类可读的多行摘要
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        if self.is_valid() {
            lines.push("配置校验通过".to_string());
        } else {
            lines.push("配置校验失败".to_string());
        }
        for key in &self.missing_required {
            lines.push(format!("  [缺失] {}", key));
        }
        for msg in &self.invalid_values {
            lines.push(format!("  [无效] {}", msg));
        }
        for msg in &self.warnings {
            lines.push(format!("  [警告] {}", msg));
        }
        lines.join("\n")
    }
}

/// 校验配置
pub fn validate(config: &Config) -> ValidationReport {
    let mut report = ValidationReport::default();

    match config.anthropic_api_key.as_deref() {
        None => report.missing_required.push("ANTHROPIC_API_KEY".to_string()),
        Some(key) if !key.starts_with("sk-ant-") => report
            .warnings
            .push("ANTHROPIC_API_KEY 不是 sk-ant- 前缀，请确认密钥类型".to_string()),
        Some(_) => {}
    }

    match config.slack_bot_token.as_deref() {
        None => report.missing_required.push("SLACK_BOT_TOKEN".to_string()),
        Some(token) if !token.starts_with("xoxb-") => report
            .invalid_values
            .push("SLACK_BOT_TOKEN 必须以 xoxb- 开头".to_string()),
        Some(_) => {}
    }

    if config.slack_signing_secret.is_none() {
        report
            .missing_required
            .push("SLACK_SIGNING_SECRET".to_string());
    }

    let positive: [(&str, u64); 7] = [
        ("ANTHROPIC_MAX_TOKENS", config.anthropic_max_tokens as u64),
        ("ANTHROPIC_TIMEOUT_SECS", config.anthropic_timeout_secs),
        ("MAX_RETRIES", config.max_retries as u64),
        ("WORKER_COUNT", config.worker_count as u64),
        ("QUEUE_CAPACITY", config.queue_capacity as u64),
        ("SIGNATURE_TOLERANCE_SECS", config.signature_tolerance_secs),
        ("HEALTH_CHECK_TIMEOUT_SECS", config.health_check_timeout_secs),
    ];
    for (key, value) in positive {
        if value == 0 {
            report.invalid_values.push(format!("{} 必须大于 0", key));
        }
    }

    if config.port == 0 {
        report
            .invalid_values
            .push("WEBHOOK_PORT 必须在 1-65535 之间".to_string());
    }

    if !(0.0..=1.0).contains(&config.anthropic_temperature) {
        report
            .invalid_values
            .push("ANTHROPIC_TEMPERATURE 必须在 0.0-1.0 之间".to_string());
    }

    if config.rate_limit_per_minute == 0 {
        report
            .warnings
            .push("RATE_LIMIT_PER_MINUTE 为 0，已关闭用户限流".to_string());
    }

    match config.warehouse_backend {
        WarehouseBackend::None => report
            .warnings
            .push("WAREHOUSE_BACKEND 未配置，对话记录不会持久化".to_string()),
        WarehouseBackend::Sqlite => {}
        WarehouseBackend::BigQuery => {
            for (key, value) in [
                ("BIGQUERY_PROJECT_ID", &config.bigquery_project_id),
                ("BIGQUERY_DATASET", &config.bigquery_dataset),
                (
                    "GOOGLE_APPLICATION_CREDENTIALS_JSON",
                    &config.google_credentials_json,
                ),
            ] {
                if value.is_none() {
                    report.missing_required.push(key.to_string());
                }
            }
        }
    }

    if config.security_validator_url.is_none() && config.security_validator_token.is_some() {
        report
            .warnings
            .push("SECURITY_VALIDATOR_TOKEN 已配置但缺少 SECURITY_VALIDATOR_URL，安全预检未启用".to_string());
    }
    if config.security_validator_url.is_some() && config.security_validator_timeout_secs == 0 {
        report
            .invalid_values
            .push("SECURITY_VALIDATOR_TIMEOUT_SECS 必须大于 0".to_string());
    }

    if config.admin_api_key.is_none() {
        report
            .warnings
            .push("ADMIN_API_KEY 未配置，/config、/logs、/test/* 无需认证".to_string());
    }

    report
}
