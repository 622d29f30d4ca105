//! 对话上下文
//!
//! 按频道 + 线程保存最近 N 轮问答，过期自动失效。仅保存在内存中。

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::anthropic::ChatMessage;

#[derive(Debug)]
struct Conversation {
    turns: VecDeque<(String, String)>,
    updated_at: Instant,
}

/// 上下文存储
pub struct ContextStore {
    max_turns: usize,
    ttl: Duration,
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl ContextStore {
    pub fn new(max_turns: usize, ttl: Duration) -> Self {
        Self {
            max_turns,
            ttl,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    /// 上下文 key：有线程时按线程隔离
    pub fn key(channel: &str, thread_ts: Option<&str>) -> String {
        match thread_ts {
            Some(ts) => format!("{}:{}", channel, ts),
            None => channel.to_string(),
        }
    }

    /// 获取历史消息（user/assistant 交替）
    pub fn history(&self, key: &str) -> Vec<ChatMessage> {
        self.history_at(key, Instant::now())
    }

    fn history_at(&self, key: &str, now: Instant) -> Vec<ChatMessage> {
        if self.max_turns == 0 {
            return Vec::new();
        }
        let conversations = self.conversations.read();
        match conversations.get(key) {
            Some(c) if now.duration_since(c.updated_at) < self.ttl => c
                .turns
                .iter()
                .flat_map(|(q, a)| [ChatMessage::user(q.clone()), ChatMessage::assistant(a.clone())])
                .collect(),
            _ => Vec::new(),
        }
    }

    /// 记录一轮问答
    pub fn record(&self, key: &str, question: &str, answer: &str) {
        self.record_at(key, question, answer, Instant::now());
    }

    fn record_at(&self, key: &str, question: &str, answer: &str, now: Instant) {
        if self.max_turns == 0 {
            return;
        }
        let mut conversations = self.conversations.write();
        let conversation = conversations
            .entry(key.to_string())
            .or_insert_with(|| Conversation {
                turns: VecDeque::new(),
                updated_at: now,
            });
        if now.duration_since(conversation.updated_at) >= self.ttl {
            conversation.turns.clear();
        }
        conversation
            .turns
            .push_back((question.to_string(), answer.to_string()));
        while conversation.turns.len() > self.max_turns {
            conversation.turns.pop_front();
        }
        conversation.updated_at = now;
    }

    /// 清理过期会话，返回清理数量
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut conversations = self.conversations.write();
        let before = conversations.len();
        conversations.retain(|_, c| now.duration_since(c.updated_at) < ttl);
        before - conversations.len()
    }

    /// 当前活跃会话数
    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        self.conversations
            .read()
            .values()
            .filter(|c| now.duration_since(c.updated_at) < self.ttl)
            .count()
    }
}
