//! SQLite 数据仓库

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;

use super::model::{ConversationRecord, GeneratedCodeRecord, MetricRecord};
use super::{StoreError, Warehouse};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        thread_ts TEXT,
        command TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        input_text TEXT NOT NULL,
        response_text TEXT NOT NULL,
        input_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        latency_ms INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        error TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_timestamp ON conversations(timestamp);
    CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id);

    CREATE TABLE IF NOT EXISTS metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        value REAL NOT NULL,
        unit TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        labels TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics(name, timestamp);

    CREATE TABLE IF NOT EXISTS generated_code (
        id TEXT PRIMARY KEY,
        user_id TEXT,
        prompt TEXT NOT NULL,
        generated_code TEXT NOT NULL,
        language TEXT NOT NULL,
        estimated_complexity TEXT NOT NULL,
        quality_score INTEGER NOT NULL,
        timestamp TEXT NOT NULL
    );";

/// SQLite 数据仓库（同步连接，在阻塞线程池中执行）
pub struct SqliteWarehouse {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWarehouse {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// 表行数
    pub async fn count(&self, table: &'static str) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT COUNT(*) FROM {}", table);
            Ok(conn.query_row(&sql, [], |row| row.get::<_, i64>(0))? as u64)
        })
        .await
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn insert_conversations(&self, records: &[ConversationRecord]) -> Result<(), StoreError> {
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for r in &records {
                tx.execute(
                    "INSERT INTO conversations (id, user_id, channel_id, thread_ts, command, timestamp, input_text, response_text, input_tokens, output_tokens, latency_ms, status, error)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    rusqlite::params![
                        r.id,
                        r.user_id,
                        r.channel_id,
                        r.thread_ts,
                        r.command,
                        r.timestamp.to_rfc3339(),
                        r.input_text,
                        r.response_text,
                        r.input_tokens as i64,
                        r.output_tokens as i64,
                        r.latency_ms as i64,
                        r.status.as_str(),
                        r.error,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn insert_metrics(&self, records: &[MetricRecord]) -> Result<(), StoreError> {
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for r in &records {
                tx.execute(
                    "INSERT INTO metrics (name, value, unit, timestamp, labels) VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        r.name,
                        r.value,
                        r.unit,
                        r.timestamp.to_rfc3339(),
                        serde_json::to_string(&r.labels)?,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn insert_generated_code(
        &self,
        records: &[GeneratedCodeRecord],
    ) -> Result<(), StoreError> {
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for r in &records {
                tx.execute(
                    "INSERT INTO generated_code (id, user_id, prompt, generated_code, language, estimated_complexity, quality_score, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        r.id,
                        r.user_id,
                        r.prompt,
                        r.generated_code,
                        r.language,
                        r.estimated_complexity,
                        r.quality_score as i64,
                        r.timestamp.to_rfc3339(),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{ConversationStatus, new_record_id};
    use chrono::Utc;

    fn conversation(status: ConversationStatus) -> ConversationRecord {
        ConversationRecord {
            id: new_record_id(),
            user_id: "U1".to_string(),
            channel_id: "C1".to_string(),
            thread_ts: Some("1.0".to_string()),
            command: "analyze".to_string(),
            timestamp: Utc::now(),
            input_text: "analyze ```x```".to_string(),
            response_text: "looks fine".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            latency_ms: 120,
            status,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_insert_conversations_batch() {
        let store = SqliteWarehouse::open_in_memory().unwrap();
        store
            .insert_conversations(&[
                conversation(ConversationStatus::Success),
                conversation(ConversationStatus::Error),
            ])
            .await
            .unwrap();
        assert_eq!(store.count("conversations").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_whole_batch() {
        let store = SqliteWarehouse::open_in_memory().unwrap();
        let record = conversation(ConversationStatus::Success);
        let result = store
            .insert_conversations(&[record.clone(), record])
            .await;
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
        // 事务回滚，不留下部分写入
        assert_eq!(store.count("conversations").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_metrics_and_code() {
        let store = SqliteWarehouse::open_in_memory().unwrap();
        store
            .insert_metrics(&[MetricRecord::new("ai_latency", 1.5, "seconds").with_label("command", "generate")])
            .await
            .unwrap();
        store
            .insert_generated_code(&[GeneratedCodeRecord {
                id: new_record_id(),
                user_id: None,
                prompt: "add two numbers".to_string(),
                generated_code: "def add(a, b): return a + b".to_string(),
                language: "python".to_string(),
                estimated_complexity: "low".to_string(),
                quality_score: 80,
                timestamp: Utc::now(),
            }])
            .await
            .unwrap();
        assert_eq!(store.count("metrics").await.unwrap(), 1);
        assert_eq!(store.count("generated_code").await.unwrap(), 1);
        assert!(store.ping().await.is_ok());
    }
}
