//! 熔断器
//!
//! 状态流转：healthy → degraded（出现失败）→ failed（连续失败达到阈值）
//! → recovering（冷却结束后放行一次试探）→ healthy / failed
//!
//! 试探请求在记录结果前被取消（许可被丢弃）时回到 failed，
//! 冷却视为已结束，下一个请求重新作为试探

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use super::AiError;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Healthy,
    Degraded,
    Failed,
    Recovering,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// 熔断器
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Healthy,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// 请求放行检查，调用结束后通过 [`CallPermit::record`] 记录结果
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, AiError> {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> Result<CallPermit<'_>, AiError> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            CircuitState::Healthy | CircuitState::Degraded => false,
            // 试探请求进行中，其余请求继续快速失败
            CircuitState::Recovering => return Err(AiError::CircuitOpen),
            CircuitState::Failed => {
                let elapsed = inner
                    .opened_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();
                if elapsed < self.recovery_timeout {
                    return Err(AiError::CircuitOpen);
                }
                tracing::info!("熔断冷却结束，放行试探请求");
                inner.state = CircuitState::Recovering;
                true
            }
        };
        Ok(CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// 试探请求未完成即被取消
    fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Recovering {
            tracing::warn!("试探请求被取消，等待下一个请求重新试探");
            inner.state = CircuitState::Failed;
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Healthy {
            tracing::info!(previous = ?inner.state, "AI 服务恢复正常");
        }
        inner.state = CircuitState::Healthy;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;

        let open = inner.state == CircuitState::Recovering
            || inner.consecutive_failures >= self.failure_threshold;
        if open {
            if inner.state != CircuitState::Failed {
                tracing::warn!(
                    failures = inner.consecutive_failures,
                    "AI 服务连续失败，熔断 {}s",
                    self.recovery_timeout.as_secs()
                );
            }
            inner.state = CircuitState::Failed;
            inner.opened_at = Some(now);
        } else {
            inner.state = CircuitState::Degraded;
        }
    }

    /// 按调用结果更新状态
    pub fn record<T>(&self, result: &Result<T, AiError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) if e.trips_breaker() => self.record_failure(),
            // 上游有响应，试探视为成功
            Err(_) if self.state() == CircuitState::Recovering => self.record_success(),
            Err(_) => {}
        }
    }
}

/// 单次调用的放行许可
#[must_use]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// 记录本次调用结果
    pub fn record<T>(mut self, result: &Result<T, AiError>) {
        self.settled = true;
        self.breaker.record(result);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.abandon_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_three_failures() {
        let breaker = CircuitBreaker::default();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Degraded);
        breaker.record_failure();
        assert!(breaker.try_acquire().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Failed);
        assert!(matches!(breaker.try_acquire(), Err(AiError::CircuitOpen)));
    }

    #[test]
    fn test_success_resets_failures() {
        let breaker = CircuitBreaker::default();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Degraded);
    }

    #[test]
    fn test_recovery_after_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        let start = Instant::now();
        breaker.record_failure_at(start);
        assert!(breaker.try_acquire_at(start + Duration::from_secs(30)).is_err());

        // 冷却结束，只放行一个试探请求
        let trial = breaker.try_acquire_at(start + Duration::from_secs(61)).unwrap();
        assert_eq!(breaker.state(), CircuitState::Recovering);
        assert!(breaker.try_acquire_at(start + Duration::from_secs(61)).is_err());

        trial.record(&Ok::<(), AiError>(()));
        assert_eq!(breaker.state(), CircuitState::Healthy);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(start);
        }
        let _trial = breaker.try_acquire_at(start + Duration::from_secs(61)).unwrap();
        breaker.record_failure_at(start + Duration::from_secs(62));
        assert_eq!(breaker.state(), CircuitState::Failed);
        assert!(breaker.try_acquire_at(start + Duration::from_secs(100)).is_err());
    }

    #[test]
    fn test_cancelled_trial_allows_next_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        let start = Instant::now();
        breaker.record_failure_at(start);

        let trial = breaker.try_acquire_at(start + Duration::from_secs(61)).unwrap();
        assert_eq!(breaker.state(), CircuitState::Recovering);
        drop(trial);
        assert_eq!(breaker.state(), CircuitState::Failed);

        let next = breaker.try_acquire_at(start + Duration::from_secs(62)).unwrap();
        assert_eq!(breaker.state(), CircuitState::Recovering);
        next.record(&Ok::<(), AiError>(()));
        assert_eq!(breaker.state(), CircuitState::Healthy);
    }

    #[test]
    fn test_normal_permit_drop_keeps_state() {
        let breaker = CircuitBreaker::default();
        breaker.record_failure();
        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::Degraded);
    }

    #[test]
    fn test_client_errors_ignored() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record::<()>(&Err(AiError::Http {
            status: 400,
            message: String::new(),
        }));
        assert_eq!(breaker.state(), CircuitState::Healthy);
    }
}
