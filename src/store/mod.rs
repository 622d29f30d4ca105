//! 数据仓库（可选的只追加持久化）
//!
//! - `sqlite`：本地文件
//! - `bigquery`：REST 流式插入
//!
//! 写入通过 [`PersistenceWriter`] 异步批量进行，至多一次

mod bigquery;
pub mod model;
mod sqlite;
pub(crate) mod writer;

pub use bigquery::{BigQueryWarehouse, ServiceAccountKey};
pub use model::{ConversationRecord, ConversationStatus, GeneratedCodeRecord, MetricRecord};
pub use sqlite::SqliteWarehouse;
pub use writer::PersistenceWriter;

use std::sync::Arc;

use async_trait::async_trait;

use crate::model::config::{Config, WarehouseBackend};

/// 存储错误
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rows rejected: {0}")]
    InsertErrors(String),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

/// 只追加的数据仓库
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// 后端名称（用于日志与健康检查）
    fn name(&self) -> &'static str;

    async fn insert_conversations(&self, records: &[ConversationRecord]) -> Result<(), StoreError>;

    async fn insert_metrics(&self, records: &[MetricRecord]) -> Result<(), StoreError>;

    async fn insert_generated_code(&self, records: &[GeneratedCodeRecord])
    -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// 按配置打开数据仓库，`none` 返回 None
pub fn open_warehouse(config: &Config) -> anyhow::Result<Option<Arc<dyn Warehouse>>> {
    match config.warehouse_backend {
        WarehouseBackend::None => Ok(None),
        WarehouseBackend::Sqlite => {
            let warehouse = SqliteWarehouse::open(&config.sqlite_path)?;
            tracing::info!(path = %config.sqlite_path, "已打开 SQLite 数据仓库");
            Ok(Some(Arc::new(warehouse)))
        }
        WarehouseBackend::BigQuery => {
            let warehouse = BigQueryWarehouse::from_config(config)?;
            tracing::info!(
                project = ?config.bigquery_project_id,
                dataset = ?config.bigquery_dataset,
                "已配置 BigQuery 数据仓库"
            );
            Ok(Some(Arc::new(warehouse)))
        }
    }
}
