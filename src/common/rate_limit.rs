//! 固定窗口速率限制
//!
//! 按 key（Slack 用户 ID 或客户端地址）计数，窗口过期后重置

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// 速率限制条目
#[derive(Debug, Clone)]
struct RateLimitEntry {
    /// 窗口内已用次数
    attempts: u32,
    /// 时间窗口开始时间
    window_start: Instant,
}

/// 超出限制
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Rate limit exceeded, retry after {}s", .retry_after.as_secs().max(1))]
pub struct RateLimitExceeded {
    /// 距窗口重置的剩余时间
    pub retry_after: Duration,
}

/// 速率限制器
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    entries: RwLock<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    /// 创建速率限制器，`max_requests` 为 0 表示不限制
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// 每分钟 `per_minute` 次
    pub fn per_minute(per_minute: u32) -> Self {
        Self::new(per_minute, Duration::from_secs(60))
    }

    /// 检查并消耗一次配额
    pub fn check(&self, key: &str) -> Result<(), RateLimitExceeded> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), RateLimitExceeded> {
        if self.max_requests == 0 {
            return Ok(());
        }

        let mut entries = self.entries.write();
        let entry = entries.entry(key.to_string()).or_insert(RateLimitEntry {
            attempts: 0,
            window_start: now,
        });

        // 检查时间窗口是否过期
        let elapsed = now.duration_since(entry.window_start);
        if elapsed >= self.window {
            entry.attempts = 0;
            entry.window_start = now;
        }

        if entry.attempts >= self.max_requests {
            let retry_after = self.window.saturating_sub(now.duration_since(entry.window_start));
            return Err(RateLimitExceeded { retry_after });
        }

        entry.attempts += 1;
        Ok(())
    }

    /// 清理过期条目
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let window = self.window;
        self.entries
            .write()
            .retain(|_, entry| now.duration_since(entry.window_start) < window);
    }

    /// 当前跟踪的 key 数量
    pub fn tracked_keys(&self) -> usize {
        self.entries.read().len()
    }
}
