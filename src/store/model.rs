//! 持久化记录数据模型
//!
//! 所有记录只追加，写入后不再修改或删除

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 对话处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Success,
    Error,
    RateLimited,
    /// 安全预检拒绝
    Blocked,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::RateLimited => "rate_limited",
            Self::Blocked => "blocked",
        }
    }
}

/// 对话记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub user_id: String,
    pub channel_id: String,
    pub thread_ts: Option<String>,
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub input_text: String,
    pub response_text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    pub status: ConversationStatus,
    pub error: Option<String>,
}

/// 指标记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
}

impl MetricRecord {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// 生成代码记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedCodeRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub prompt: String,
    pub generated_code: String,
    pub language: String,
    pub estimated_complexity: String,
    /// 0-100
    pub quality_score: u8,
    pub timestamp: DateTime<Utc>,
}

pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
