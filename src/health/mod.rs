//! 依赖健康检查
//!
//! 各探针并发执行并带超时。聚合规则：
//! - 全部健康 → `healthy`
//! - 仅可选依赖（数据仓库）异常 → `degraded`
//! - 任一必需依赖（anthropic / slack）异常 → `unhealthy`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use crate::anthropic::CompletionClient;
use crate::slack::ChatPoster;
use crate::store::Warehouse;

/// 单个依赖的探针
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// 必需依赖异常时整体为 unhealthy，否则为 degraded
    fn required(&self) -> bool;

    /// 未启用的依赖报告为 disabled，不参与聚合
    fn enabled(&self) -> bool {
        true
    }

    async fn check(&self) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Unhealthy,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallStatus {
    pub fn is_healthy(&self) -> bool {
        *self == Self::Healthy
    }
}

/// 检查结果
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub status: OverallStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// 健康检查器
pub struct HealthChecker {
    probes: Vec<Arc<dyn HealthProbe>>,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>, timeout: Duration) -> Self {
        Self { probes, timeout }
    }

    /// 并发执行所有探针
    pub async fn check(&self) -> HealthSummary {
        let checks = self.probes.iter().map(|probe| {
            let probe = probe.clone();
            let timeout = self.timeout;
            async move {
                let health = run_probe(probe.as_ref(), timeout).await;
                (probe, health)
            }
        });
        let results = futures::future::join_all(checks).await;

        let mut status = OverallStatus::Healthy;
        let mut components = BTreeMap::new();
        for (probe, health) in results {
            if health.status == ComponentStatus::Unhealthy {
                tracing::warn!(
                    component = probe.name(),
                    error = health.error.as_deref().unwrap_or(""),
                    "依赖健康检查失败"
                );
                status = if probe.required() {
                    OverallStatus::Unhealthy
                } else if status == OverallStatus::Healthy {
                    OverallStatus::Degraded
                } else {
                    status
                };
            }
            components.insert(probe.name().to_string(), health);
        }

        HealthSummary { status, components }
    }
}

async fn run_probe(probe: &dyn HealthProbe, timeout: Duration) -> ComponentHealth {
    if !probe.enabled() {
        return ComponentHealth {
            status: ComponentStatus::Disabled,
            latency_ms: 0,
            error: None,
        };
    }

    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, probe.check()).await {
        Ok(result) => result,
        Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(()) => ComponentHealth {
            status: ComponentStatus::Healthy,
            latency_ms,
            error: None,
        },
        Err(error) => ComponentHealth {
            status: ComponentStatus::Unhealthy,
            latency_ms,
            error: Some(error),
        },
    }
}

// === 探针实现 ===

/// Anthropic API 探针
pub struct AnthropicProbe(pub Arc<dyn CompletionClient>);

#[async_trait]
impl HealthProbe for AnthropicProbe {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn required(&self) -> bool {
        true
    }

    async fn check(&self) -> Result<(), String> {
        self.0.ping().await.map_err(|e| e.to_string())
    }
}

/// Slack Web API 探针（auth.test）
pub struct SlackProbe(pub Arc<dyn ChatPoster>);

#[async_trait]
impl HealthProbe for SlackProbe {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn required(&self) -> bool {
        true
    }

    async fn check(&self) -> Result<(), String> {
        self.0.auth_test().await.map(|_| ()).map_err(|e| e.to_string())
    }
}

/// 数据仓库探针，未配置时为 disabled
pub struct WarehouseProbe(pub Option<Arc<dyn Warehouse>>);

#[async_trait]
impl HealthProbe for WarehouseProbe {
    fn name(&self) -> &'static str {
        "warehouse"
    }

    fn required(&self) -> bool {
        false
    }

    fn enabled(&self) -> bool {
        self.0.is_some()
    }

    async fn check(&self) -> Result<(), String> {
        match &self.0 {
            Some(warehouse) => warehouse.ping().await.map_err(|e| e.to_string()),
            None => Ok(()),
        }
    }
}

/// 进程常驻内存（仅 Linux，读取 /proc/self/status 的 VmRSS）
pub fn memory_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

/// 解析 `VmRSS:   1234 kB` 行
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value * 1024),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 可配置结果与耗时的探针
    pub(crate) struct StubProbe {
        pub name: &'static str,
        pub required: bool,
        pub delay: Duration,
        pub result: Result<(), String>,
    }

    impl StubProbe {
        pub fn ok(name: &'static str, required: bool) -> Arc<dyn HealthProbe> {
            Arc::new(Self {
                name,
                required,
                delay: Duration::ZERO,
                result: Ok(()),
            })
        }

        pub fn failing(name: &'static str, required: bool) -> Arc<dyn HealthProbe> {
            Arc::new(Self {
                name,
                required,
                delay: Duration::ZERO,
                result: Err("connection refused".to_string()),
            })
        }

        pub fn hanging(name: &'static str) -> Arc<dyn HealthProbe> {
            Arc::new(Self {
                name,
                required: true,
                delay: Duration::from_secs(30),
                result: Ok(()),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for StubProbe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn required(&self) -> bool {
            self.required
        }

        async fn check(&self) -> Result<(), String> {
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    fn checker(probes: Vec<Arc<dyn HealthProbe>>) -> HealthChecker {
        HealthChecker::new(probes, Duration::from_millis(100))
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tslack-code-agent\nVmPeak:\t  90000 kB\nVmRSS:\t   20480 kB\nThreads:\t8\n";
        assert_eq!(parse_vm_rss(status), Some(20480 * 1024));
        assert_eq!(parse_vm_rss("Name:\tx\nThreads:\t1\n"), None);
        assert_eq!(parse_vm_rss("VmRSS:\tlots kB\n"), None);
    }

    #[tokio::test]
    async fn test_all_healthy() {
        let summary = checker(vec![
            StubProbe::ok("anthropic", true),
            StubProbe::ok("slack", true),
            Arc::new(WarehouseProbe(None)),
        ])
        .check()
        .await;
        assert_eq!(summary.status, OverallStatus::Healthy);
        assert_eq!(summary.components["warehouse"].status, ComponentStatus::Disabled);
        assert_eq!(summary.components["anthropic"].status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_timeout_marks_unhealthy() {
        let summary = checker(vec![StubProbe::hanging("anthropic"), StubProbe::ok("slack", true)])
            .check()
            .await;
        assert_eq!(summary.status, OverallStatus::Unhealthy);
        let anthropic = &summary.components["anthropic"];
        assert_eq!(anthropic.status, ComponentStatus::Unhealthy);
        assert!(anthropic.error.as_deref().unwrap().contains("timed out"));
        assert!(anthropic.latency_ms >= 100);
    }

    #[tokio::test]
    async fn test_optional_failure_degrades() {
        let summary = checker(vec![
            StubProbe::ok("anthropic", true),
            StubProbe::failing("warehouse", false),
        ])
        .check()
        .await;
        assert_eq!(summary.status, OverallStatus::Degraded);

        let summary = checker(vec![
            StubProbe::failing("warehouse", false),
            StubProbe::failing("slack", true),
        ])
        .check()
        .await;
        assert_eq!(summary.status, OverallStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_required_failure_not_downgraded_by_later_optional() {
        let summary = checker(vec![
            StubProbe::failing("slack", true),
            StubProbe::failing("warehouse", false),
        ])
        .check()
        .await;
        assert_eq!(summary.status, OverallStatus::Unhealthy);
    }
}
