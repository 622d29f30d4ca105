//! 后台任务池
//!
//! Webhook 处理器只负责入队并立即确认；分发循环从有界通道取任务，
//! 在 `WORKER_COUNT` 个许可的信号量下并发执行。不同对话之间不保证顺序。

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

use crate::analysis;
use crate::common::rate_limit::RateLimiter;
use crate::common::truncate_with_ellipsis;
use crate::dispatch::context::ContextStore;
use crate::dispatch::{DispatchOutcome, Dispatcher, prompt};
use crate::metrics::Metrics;
use crate::security::{QueryScreener, Verdict};
use crate::slack::types::SlashCommand;
use crate::slack::{ChatPoster, MessageSplitter};
use crate::store::PersistenceWriter;
use crate::store::model::{
    ConversationRecord, ConversationStatus, GeneratedCodeRecord, MetricRecord, new_record_id,
};

/// 待处理任务
#[derive(Debug, Clone)]
pub enum Job {
    /// Events API 消息（@提及或私聊）
    Event {
        user: String,
        channel: String,
        text: String,
        /// 所在线程，为空时以消息本身开启线程
        thread_ts: Option<String>,
        ts: Option<String>,
    },
    /// Slash command
    Slash(SlashCommand),
}

impl Job {
    fn user(&self) -> &str {
        match self {
            Self::Event { user, .. } => user,
            Self::Slash(cmd) => &cmd.user_id,
        }
    }
}

/// 入队失败（队列已满或已关闭）
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("work queue is full")]
    Full,
    #[error("work queue is closed")]
    Closed,
}

/// 任务执行依赖
pub struct WorkerDeps {
    pub dispatcher: Arc<Dispatcher>,
    pub chat: Arc<dyn ChatPoster>,
    pub splitter: MessageSplitter,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub writer: Option<Arc<PersistenceWriter>>,
    /// 安全预检，未配置时跳过
    pub screener: Option<Arc<dyn QueryScreener>>,
}

/// 回复目标
enum ReplyTarget {
    Thread {
        channel: String,
        thread_ts: Option<String>,
    },
    ResponseUrl(String),
}

/// 任务池
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
    worker_count: usize,
}

impl WorkerPool {
    pub fn spawn(deps: WorkerDeps, worker_count: usize, capacity: usize) -> Self {
        let worker_count = worker_count.max(1);
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let handle = tokio::spawn(Self::dispatch_loop(Arc::new(deps), receiver, worker_count));
        tracing::info!(worker_count, capacity, "任务池已启动");
        Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            capacity,
            worker_count,
        }
    }

    /// 非阻塞入队
    pub fn try_enqueue(&self, job: Job) -> Result<(), EnqueueError> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(EnqueueError::Closed);
        };
        tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// 排队中的任务数
    pub fn queue_depth(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(|tx| self.capacity.saturating_sub(tx.capacity()))
            .unwrap_or(0)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// 停止接收新任务，等待已入队和执行中的任务完成
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("任务分发循环异常退出: {}", e);
            }
        }
    }

    async fn dispatch_loop(
        deps: Arc<WorkerDeps>,
        mut receiver: mpsc::Receiver<Job>,
        worker_count: usize,
    ) {
        let semaphore = Arc::new(Semaphore::new(worker_count));
        while let Some(job) = receiver.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let deps = deps.clone();
            tokio::spawn(async move {
                let _permit = permit;
                process_job(&deps, job).await;
            });
        }

        // 等待执行中的任务全部归还许可
        if semaphore.acquire_many(worker_count as u32).await.is_err() {
            tracing::warn!("等待执行中任务时信号量已关闭");
        }
        tracing::info!("任务池已停止");
    }
}

/// 执行单个任务：限流 → 安全预检 → 分发 → 回复 → 指标 → 持久化
async fn process_job(deps: &WorkerDeps, job: Job) {
    let user = job.user().to_string();
    let (channel, input, thread_ts, target, context_key) = match job {
        Job::Event {
            channel,
            text,
            thread_ts,
            ts,
            ..
        } => {
            let reply_ts = thread_ts.clone().or(ts);
            let key = ContextStore::key(&channel, reply_ts.as_deref());
            let target = ReplyTarget::Thread {
                channel: channel.clone(),
                thread_ts: reply_ts.clone(),
            };
            (channel, text, reply_ts, target, Some(key))
        }
        Job::Slash(cmd) => {
            let input = cmd.dispatch_input();
            let target = match cmd.response_url {
                Some(url) => ReplyTarget::ResponseUrl(url),
                None => ReplyTarget::Thread {
                    channel: cmd.channel_id.clone(),
                    thread_ts: None,
                },
            };
            (cmd.channel_id, input, None, target, None)
        }
    };

    if let Err(e) = deps.rate_limiter.check(&user) {
        tracing::warn!(user = %user, "用户超出速率限制");
        deps.metrics.record_error("rate_limit_error");
        deps.metrics.record_command("rate_limited", ConversationStatus::RateLimited.as_str());
        let notice = format!(
            "You're sending requests too quickly. Please try again in {} seconds.",
            e.retry_after.as_secs().max(1)
        );
        deliver(deps, &target, &notice).await;
        if let Some(writer) = &deps.writer {
            writer.record_conversation(ConversationRecord {
                id: new_record_id(),
                user_id: user,
                channel_id: channel,
                thread_ts,
                command: "rate_limited".to_string(),
                timestamp: Utc::now(),
                input_text: input,
                response_text: notice,
                input_tokens: 0,
                output_tokens: 0,
                latency_ms: 0,
                status: ConversationStatus::RateLimited,
                error: Some(e.to_string()),
            });
        }
        return;
    }

    if let Some(screener) = deps.screener.as_ref().filter(|_| !input.trim().is_empty()) {
        if let Verdict::Block { reason } = screener.screen(&input).await {
            tracing::warn!(user = %user, reason = %reason, "请求未通过安全预检");
            deps.metrics
                .record_command("blocked", ConversationStatus::Blocked.as_str());
            let notice = "Sorry, I can't process this request for security reasons.".to_string();
            deliver(deps, &target, &notice).await;
            if let Some(writer) = &deps.writer {
                writer.record_conversation(ConversationRecord {
                    id: new_record_id(),
                    user_id: user,
                    channel_id: channel,
                    thread_ts,
                    command: "blocked".to_string(),
                    timestamp: Utc::now(),
                    input_text: input,
                    response_text: notice,
                    input_tokens: 0,
                    output_tokens: 0,
                    latency_ms: 0,
                    status: ConversationStatus::Blocked,
                    error: Some(reason),
                });
            }
            return;
        }
    }

    let outcome = deps.dispatcher.dispatch(&input, context_key.as_deref()).await;
    tracing::info!(
        user = %user,
        command = %outcome.command,
        status = outcome.status.as_str(),
        latency_ms = outcome.latency_ms,
        "命令处理完成"
    );

    deps.metrics
        .record_command(&outcome.command, outcome.status.as_str());
    if outcome.called_ai {
        if outcome.status == ConversationStatus::Success {
            deps.metrics
                .record_ai_call(&outcome.usage, outcome.latency_ms);
        } else {
            deps.metrics.record_error("api_error");
        }
    }
    deps.metrics
        .set_active_conversations(deps.dispatcher.context().active_count());

    deliver(deps, &target, &outcome.text).await;

    if let Some(writer) = &deps.writer {
        persist(writer, &user, channel, thread_ts, input, &outcome);
    }
}

/// 拆分并发送回复，单条失败即停止剩余部分
async fn deliver(deps: &WorkerDeps, target: &ReplyTarget, text: &str) {
    let parts = deps.splitter.split(text);
    let total = parts.len();
    for (i, part) in parts.iter().enumerate() {
        let result = match target {
            ReplyTarget::Thread { channel, thread_ts } => deps
                .chat
                .post_message(channel, part, thread_ts.as_deref())
                .await
                .map(|_| ()),
            ReplyTarget::ResponseUrl(url) => deps.chat.respond(url, part).await,
        };
        if let Err(e) = result {
            tracing::error!(part = i + 1, total, "发送 Slack 回复失败: {}", e);
            deps.metrics.record_error("slack_error");
            return;
        }
    }
}

fn persist(
    writer: &PersistenceWriter,
    user: &str,
    channel: String,
    thread_ts: Option<String>,
    input: String,
    outcome: &DispatchOutcome,
) {
    writer.record_conversation(ConversationRecord {
        id: new_record_id(),
        user_id: user.to_string(),
        channel_id: channel,
        thread_ts,
        command: outcome.command.clone(),
        timestamp: Utc::now(),
        input_text: input,
        response_text: outcome.text.clone(),
        input_tokens: outcome.usage.input_tokens,
        output_tokens: outcome.usage.output_tokens,
        latency_ms: outcome.latency_ms,
        status: outcome.status,
        error: outcome.error.clone(),
    });

    if outcome.called_ai && outcome.status == ConversationStatus::Success {
        writer.record_metric(
            MetricRecord::new("ai_latency", outcome.latency_ms as f64, "ms")
                .with_label("command", outcome.command.as_str()),
        );
        writer.record_metric(
            MetricRecord::new("ai_tokens", outcome.usage.total() as f64, "tokens")
                .with_label("command", outcome.command.as_str()),
        );
    }

    if let Some(code) = &outcome.generated_code {
        let language = outcome
            .language
            .as_deref()
            .unwrap_or(prompt::DEFAULT_LANGUAGE);
        let analysis = analysis::analyze(code, language);
        writer.record_generated_code(GeneratedCodeRecord {
            id: new_record_id(),
            user_id: Some(user.to_string()),
            prompt: truncate_with_ellipsis(&outcome.prompt, 10_000),
            generated_code: code.clone(),
            language: language.to_string(),
            estimated_complexity: analysis.estimated_complexity.as_str().to_string(),
            quality_score: analysis.quality_score,
            timestamp: Utc::now(),
        });
    }
}
