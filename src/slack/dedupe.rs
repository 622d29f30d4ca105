//! 事件去重
//!
//! Slack 在 3 秒内未收到确认时会重发同一事件（相同 event_id），
//! 这里记录最近处理过的 event_id，过期条目由后台任务周期清理

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct EventDeduper {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl EventDeduper {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// 首次出现返回 true 并记录，重复返回 false
    pub fn first_seen(&self, event_id: &str) -> bool {
        self.first_seen_at(event_id, Instant::now())
    }

    fn first_seen_at(&self, event_id: &str, now: Instant) -> bool {
        let mut seen = self.seen.lock();
        match seen.get(event_id) {
            Some(at) if now.duration_since(*at) < self.ttl => false,
            _ => {
                seen.insert(event_id.to_string(), now);
                true
            }
        }
    }

    /// 移除记录（入队失败时允许 Slack 重试）
    pub fn forget(&self, event_id: &str) {
        self.seen.lock().remove(event_id);
    }

    /// 清理过期条目，返回清理数量
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Instant::now())
    }

    fn cleanup_expired_at(&self, now: Instant) -> usize {
        let mut seen = self.seen.lock();
        let before = seen.len();
        let ttl = self.ttl;
        seen.retain(|_, at| now.saturating_duration_since(*at) < ttl);
        before - seen.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detected() {
        let dedupe = EventDeduper::new(Duration::from_secs(600));
        assert!(dedupe.first_seen("Ev1"));
        assert!(!dedupe.first_seen("Ev1"));
        assert!(dedupe.first_seen("Ev2"));
    }

    #[test]
    fn test_expired_entry_accepted_again() {
        let dedupe = EventDeduper::new(Duration::from_secs(10));
        let start = Instant::now();
        assert!(dedupe.first_seen_at("Ev1", start));
        assert!(!dedupe.first_seen_at("Ev1", start + Duration::from_secs(5)));
        assert!(dedupe.first_seen_at("Ev1", start + Duration::from_secs(11)));
    }

    #[test]
    fn test_forget_allows_retry() {
        let dedupe = EventDeduper::new(Duration::from_secs(600));
        assert!(dedupe.first_seen("Ev1"));
        dedupe.forget("Ev1");
        assert!(dedupe.first_seen("Ev1"));
    }

    #[test]
    fn test_insert_does_not_sweep() {
        let dedupe = EventDeduper::new(Duration::from_secs(1));
        let start = Instant::now();
        for i in 0..2000 {
            dedupe.first_seen_at(&format!("Ev{}", i), start);
        }
        dedupe.first_seen_at("late", start + Duration::from_secs(5));
        assert_eq!(dedupe.len(), 2001);
    }

    #[test]
    fn test_cleanup_expired_keeps_live_entries() {
        let dedupe = EventDeduper::new(Duration::from_secs(10));
        let start = Instant::now();
        for i in 0..100 {
            dedupe.first_seen_at(&format!("Ev{}", i), start);
        }
        dedupe.first_seen_at("fresh", start + Duration::from_secs(8));

        assert_eq!(dedupe.cleanup_expired_at(start + Duration::from_secs(12)), 100);
        assert_eq!(dedupe.len(), 1);
        assert!(!dedupe.first_seen_at("fresh", start + Duration::from_secs(12)));
        assert_eq!(dedupe.cleanup_expired_at(start + Duration::from_secs(12)), 0);
    }
}
