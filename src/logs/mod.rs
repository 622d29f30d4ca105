//! 日志初始化与内存日志缓冲
//!
//! 除了标准输出外，最近的 N 条日志保存在环形缓冲中，供 `GET /logs` 查询

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::model::config::LogFormat;

/// 单条日志
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// 日志查询条件
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// 最低级别（含）
    pub min_level: Option<Level>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// 固定容量的日志环形缓冲
#[derive(Clone)]
pub struct LogBuffer {
    capacity: usize,
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(4096)))),
        }
    }

    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// 按条件查询，返回最新的 `limit` 条（时间正序）
    pub fn query(&self, query: &LogQuery) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let mut matched: Vec<LogEntry> = entries
            .iter()
            .rev()
            .filter(|e| match query.min_level {
                Some(min) => level_of(&e.level).is_some_and(|l| l <= min),
                None => true,
            })
            .filter(|e| query.since.is_none_or(|since| e.timestamp >= since))
            .take(query.limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    /// 作为 tracing Layer 使用
    pub fn layer(&self) -> LogBufferLayer {
        LogBufferLayer {
            buffer: self.clone(),
        }
    }
}

/// 解析日志级别字符串（大小写不敏感）
pub fn level_of(raw: &str) -> Option<Level> {
    raw.trim().parse::<Level>().ok()
}

/// 把事件写入 [`LogBuffer`] 的 Layer
pub struct LogBufferLayer {
    buffer: LogBuffer,
}

impl<S> Layer<S> for LogBufferLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        self.buffer.push(LogEntry {
            timestamp: Utc::now(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        });
    }
}

/// 把 message 与其余字段拼成一行文本
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

/// 初始化全局 tracing subscriber
///
/// `RUST_LOG` 优先于 `LOG_LEVEL`
pub fn init_tracing(log_level: &str, format: LogFormat, buffer: &LogBuffer) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let (text_layer, json_layer) = match format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer().with_target(true)), None),
        LogFormat::Json => (
            None,
            Some(tracing_subscriber::fmt::layer().json().with_target(true)),
        ),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(buffer.layer())
        .init();
}
