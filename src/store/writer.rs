//! 异步批量写入
//!
//! `record_*` 只做 `try_send`，通道满时丢弃并计数；后台任务一次最多取 500 条
//! 按类型分组写入。写入失败只记录日志，不重试，因此整体语义为至多一次。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use prometheus::IntCounter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Warehouse;
use super::model::{ConversationRecord, GeneratedCodeRecord, MetricRecord};

const MAX_BATCH: usize = 500;

enum PersistItem {
    Conversation(ConversationRecord),
    Metric(MetricRecord),
    GeneratedCode(GeneratedCodeRecord),
}

/// 持久化写入器
pub struct PersistenceWriter {
    sender: Mutex<Option<mpsc::Sender<PersistItem>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    dropped: IntCounter,
    failed: Arc<AtomicU64>,
    backend: &'static str,
}

impl PersistenceWriter {
    /// 创建写入器并启动后台写入任务
    pub fn spawn(warehouse: Arc<dyn Warehouse>, capacity: usize, dropped: IntCounter) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let failed = Arc::new(AtomicU64::new(0));
        let backend = warehouse.name();
        let handle = tokio::spawn(Self::consume_loop(warehouse, receiver, failed.clone()));
        Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            dropped,
            failed,
            backend,
        }
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn record_conversation(&self, record: ConversationRecord) {
        self.enqueue(PersistItem::Conversation(record));
    }

    pub fn record_metric(&self, record: MetricRecord) {
        self.enqueue(PersistItem::Metric(record));
    }

    pub fn record_generated_code(&self, record: GeneratedCodeRecord) {
        self.enqueue(PersistItem::GeneratedCode(record));
    }

    fn enqueue(&self, item: PersistItem) {
        let sender = self.sender.lock();
        let result = match sender.as_ref() {
            Some(tx) => tx.try_send(item).map_err(|e| e.to_string()),
            None => Err("writer closed".to_string()),
        };
        if let Err(e) = result {
            self.dropped.inc();
            tracing::warn!("持久化队列不可用，丢弃记录: {}", e);
        }
    }

    /// 被丢弃的记录数
    pub fn dropped_count(&self) -> u64 {
        self.dropped.get()
    }

    /// 写入失败的记录数
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// 关闭通道并等待已入队的记录写完
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("持久化任务异常退出: {}", e);
            }
        }
    }

    async fn consume_loop(
        warehouse: Arc<dyn Warehouse>,
        mut receiver: mpsc::Receiver<PersistItem>,
        failed: Arc<AtomicU64>,
    ) {
        while let Some(first) = receiver.recv().await {
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH {
                match receiver.try_recv() {
                    Ok(item) => batch.push(item),
                    Err(_) => break,
                }
            }

            let mut conversations = Vec::new();
            let mut metrics = Vec::new();
            let mut code = Vec::new();
            for item in batch {
                match item {
                    PersistItem::Conversation(r) => conversations.push(r),
                    PersistItem::Metric(r) => metrics.push(r),
                    PersistItem::GeneratedCode(r) => code.push(r),
                }
            }

            if !conversations.is_empty() {
                if let Err(e) = warehouse.insert_conversations(&conversations).await {
                    failed.fetch_add(conversations.len() as u64, Ordering::Relaxed);
                    tracing::error!(rows = conversations.len(), "写入对话记录失败: {}", e);
                }
            }
            if !metrics.is_empty() {
                if let Err(e) = warehouse.insert_metrics(&metrics).await {
                    failed.fetch_add(metrics.len() as u64, Ordering::Relaxed);
                    tracing::error!(rows = metrics.len(), "写入指标记录失败: {}", e);
                }
            }
            if !code.is_empty() {
                if let Err(e) = warehouse.insert_generated_code(&code).await {
                    failed.fetch_add(code.len() as u64, Ordering::Relaxed);
                    tracing::error!(rows = code.len(), "写入生成代码记录失败: {}", e);
                }
            }
        }
        tracing::debug!("持久化写入循环已退出");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::StoreError;
    use crate::store::model::{ConversationStatus, new_record_id};
    use async_trait::async_trait;
    use chrono::Utc;

    /// 内存数据仓库替身
    #[derive(Default)]
    pub(crate) struct MemoryWarehouse {
        pub conversations: Mutex<Vec<ConversationRecord>>,
        pub metrics: Mutex<Vec<MetricRecord>>,
        pub code: Mutex<Vec<GeneratedCodeRecord>>,
        pub fail: bool,
    }

    impl MemoryWarehouse {
        pub fn total(&self) -> usize {
            self.conversations.lock().len() + self.metrics.lock().len() + self.code.lock().len()
        }
    }

    #[async_trait]
    impl Warehouse for MemoryWarehouse {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn insert_conversations(
            &self,
            records: &[ConversationRecord],
        ) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Network("down".into()));
            }
            self.conversations.lock().extend_from_slice(records);
            Ok(())
        }

        async fn insert_metrics(&self, records: &[MetricRecord]) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Network("down".into()));
            }
            self.metrics.lock().extend_from_slice(records);
            Ok(())
        }

        async fn insert_generated_code(
            &self,
            records: &[GeneratedCodeRecord],
        ) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Network("down".into()));
            }
            self.code.lock().extend_from_slice(records);
            Ok(())
        }

        async fn ping(&self) -> Result<(), StoreError> {
            if self.fail {
                Err(StoreError::Network("down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn conversation() -> ConversationRecord {
        ConversationRecord {
            id: new_record_id(),
            user_id: "U1".into(),
            channel_id: "C1".into(),
            thread_ts: None,
            command: "help".into(),
            timestamp: Utc::now(),
            input_text: "help".into(),
            response_text: "help text".into(),
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            status: ConversationStatus::Success,
            error: None,
        }
    }

    fn counter() -> IntCounter {
        IntCounter::new("test_dropped_total", "dropped").unwrap()
    }

    #[tokio::test]
    async fn test_records_flushed_on_shutdown() {
        let warehouse = Arc::new(MemoryWarehouse::default());
        let writer = PersistenceWriter::spawn(warehouse.clone(), 16, counter());
        writer.record_conversation(conversation());
        writer.record_metric(MetricRecord::new("latency", 1.0, "ms"));
        writer.shutdown().await;

        assert_eq!(warehouse.conversations.lock().len(), 1);
        assert_eq!(warehouse.metrics.lock().len(), 1);
        assert_eq!(writer.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_records_after_shutdown_are_dropped() {
        let warehouse = Arc::new(MemoryWarehouse::default());
        let writer = PersistenceWriter::spawn(warehouse.clone(), 16, counter());
        writer.shutdown().await;
        writer.record_conversation(conversation());
        assert_eq!(writer.dropped_count(), 1);
        assert_eq!(warehouse.total(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops_without_blocking() {
        let warehouse = Arc::new(MemoryWarehouse::default());
        // 单线程运行时：消费任务在本函数让出之前不会运行
        let writer = PersistenceWriter::spawn(warehouse.clone(), 2, counter());
        for _ in 0..5 {
            writer.record_conversation(conversation());
        }
        assert_eq!(writer.dropped_count(), 3);
        writer.shutdown().await;
        assert_eq!(warehouse.conversations.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_write_failures_counted_not_retried() {
        let warehouse = Arc::new(MemoryWarehouse {
            fail: true,
            ..Default::default()
        });
        let writer = PersistenceWriter::spawn(warehouse.clone(), 16, counter());
        writer.record_conversation(conversation());
        writer.record_conversation(conversation());
        writer.shutdown().await;
        assert_eq!(writer.failed_count(), 2);
        assert_eq!(warehouse.total(), 0);
    }
}
