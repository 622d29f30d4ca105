//! Prometheus 指标
//!
//! 所有指标以 `slack_agent_` 为前缀，注册在独立的 Registry 中，
//! `/metrics` 输出文本格式，`/metrics.json` 输出等价的 JSON。

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use serde::Serialize;

use crate::anthropic::Usage;

const PREFIX: &str = "slack_agent";

/// 指标集合
pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    active_conversations: IntGauge,
    errors_total: IntCounterVec,
    commands_total: IntCounterVec,
    ai_tokens_total: IntCounterVec,
    ai_request_duration: Histogram,
    persistence_dropped_total: IntCounter,
    uptime_seconds: IntGauge,
    started_at: Instant,
}

fn name(suffix: &str) -> String {
    format!("{}_{}", PREFIX, suffix)
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(name("requests_total"), "HTTP requests by endpoint and status"),
            &["endpoint", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                name("request_duration_seconds"),
                "HTTP request duration in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["endpoint"],
        )?;
        let active_conversations = IntGauge::new(
            name("active_conversations"),
            "Conversations with unexpired context",
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new(name("errors_total"), "Errors by type"),
            &["type"],
        )?;
        let commands_total = IntCounterVec::new(
            Opts::new(name("commands_total"), "Dispatched commands by command and status"),
            &["command", "status"],
        )?;
        let ai_tokens_total = IntCounterVec::new(
            Opts::new(name("ai_tokens_total"), "AI tokens by direction"),
            &["direction"],
        )?;
        let ai_request_duration = Histogram::with_opts(
            HistogramOpts::new(
                name("ai_request_duration_seconds"),
                "AI request latency in seconds, retries included",
            )
            .buckets(vec![0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0]),
        )?;
        let persistence_dropped_total = IntCounter::new(
            name("persistence_dropped_total"),
            "Records dropped because the persistence queue was full",
        )?;
        let uptime_seconds = IntGauge::new(name("uptime_seconds"), "Process uptime in seconds")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(active_conversations.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(commands_total.clone()))?;
        registry.register(Box::new(ai_tokens_total.clone()))?;
        registry.register(Box::new(ai_request_duration.clone()))?;
        registry.register(Box::new(persistence_dropped_total.clone()))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            active_conversations,
            errors_total,
            commands_total,
            ai_tokens_total,
            ai_request_duration,
            persistence_dropped_total,
            uptime_seconds,
            started_at: Instant::now(),
        })
    }

    pub fn observe_request(&self, endpoint: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[endpoint, status.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[endpoint])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_error(&self, error_type: &str) {
        self.errors_total.with_label_values(&[error_type]).inc();
    }

    pub fn record_command(&self, command: &str, status: &str) {
        self.commands_total
            .with_label_values(&[command, status])
            .inc();
    }

    pub fn record_ai_call(&self, usage: &Usage, latency_ms: u64) {
        self.ai_tokens_total
            .with_label_values(&["input"])
            .inc_by(usage.input_tokens);
        self.ai_tokens_total
            .with_label_values(&["output"])
            .inc_by(usage.output_tokens);
        self.ai_request_duration
            .observe(latency_ms as f64 / 1000.0);
    }

    pub fn set_active_conversations(&self, count: usize) {
        self.active_conversations.set(count as i64);
    }

    /// 持久化丢弃计数器（交给写入器直接累加）
    pub fn persistence_dropped(&self) -> IntCounter {
        self.persistence_dropped_total.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Prometheus 文本格式
    pub fn render_text(&self) -> Result<String, prometheus::Error> {
        self.uptime_seconds.set(self.uptime().as_secs() as i64);

        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// JSON 格式
    pub fn render_json(&self) -> Result<MetricsSnapshot, prometheus::Error> {
        Ok(parse_exposition(&self.render_text()?))
    }
}

/// `/metrics.json` 响应
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub metrics: Vec<MetricFamilyJson>,
}

#[derive(Debug, Serialize)]
pub struct MetricFamilyJson {
    pub name: String,
    pub help: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub samples: Vec<SampleJson>,
}

#[derive(Debug, Serialize)]
pub struct SampleJson {
    /// 样本名，直方图的 `_bucket` / `_sum` / `_count` 与族名不同
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// 解析文本格式为 JSON 结构
fn parse_exposition(text: &str) -> MetricsSnapshot {
    let mut families: Vec<MetricFamilyJson> = Vec::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("# HELP ") {
            let (name, help) = rest.split_once(' ').unwrap_or((rest, ""));
            families.push(MetricFamilyJson {
                name: name.to_string(),
                help: unescape(help),
                metric_type: "untyped".to_string(),
                samples: Vec::new(),
            });
        } else if let Some(rest) = line.strip_prefix("# TYPE ") {
            let (name, ty) = rest.split_once(' ').unwrap_or((rest, "untyped"));
            if let Some(family) = families.iter_mut().rev().find(|f| f.name == name) {
                family.metric_type = ty.to_string();
            }
        } else if !line.starts_with('#') {
            let Some(sample) = parse_sample(line) else {
                continue;
            };
            // 样本紧跟在所属族的 HELP/TYPE 之后
            if let Some(family) = families.last_mut() {
                family.samples.push(sample);
            }
        }
    }

    MetricsSnapshot { metrics: families }
}

fn parse_sample(line: &str) -> Option<SampleJson> {
    let (name, labels, rest) = match line.find('{') {
        Some(open) => {
            let close = find_label_end(line, open)?;
            (
                &line[..open],
                parse_labels(&line[open + 1..close]),
                &line[close + 1..],
            )
        }
        None => {
            let (name, rest) = line.split_once(' ')?;
            (name, BTreeMap::new(), rest)
        }
    };

    let value = match rest.split_whitespace().next()? {
        "+Inf" => f64::INFINITY,
        "-Inf" => f64::NEG_INFINITY,
        v => v.parse().ok()?,
    };

    Some(SampleJson {
        name: name.to_string(),
        labels,
        value,
    })
}

/// 找到与 `{` 匹配的 `}`，跳过引号内的内容
fn find_label_end(line: &str, open: usize) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in line[open..].char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => in_quotes = !in_quotes,
            '}' if !in_quotes => return Some(open + i),
            _ => {}
        }
    }
    None
}

fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut rest = raw;
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim_start_matches(',').trim().to_string();
        let value_start = eq + 2;
        let mut value = String::new();
        let mut end = None;
        let mut chars = rest[value_start..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, next)) = chars.next() {
                        value.push(match next {
                            'n' => '\n',
                            other => other,
                        });
                    }
                }
                '"' => {
                    end = Some(value_start + i + 1);
                    break;
                }
                other => value.push(other),
            }
        }
        labels.insert(key, value);
        match end {
            Some(end) => rest = &rest[end..],
            None => break,
        }
    }
    labels
}

fn unescape(s: &str) -> String {
    s.replace("\\n", "\n").replace("\\\\", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_exposition_contains_all_families() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_request("/health", 200, Duration::from_millis(12));
        metrics.record_error("api_error");
        metrics.record_command("analyze", "success");
        metrics.record_ai_call(
            &Usage {
                input_tokens: 100,
                output_tokens: 40,
            },
            1500,
        );
        metrics.set_active_conversations(3);
        metrics.persistence_dropped().inc();

        let text = metrics.render_text().unwrap();
        for family in [
            "slack_agent_requests_total",
            "slack_agent_request_duration_seconds",
            "slack_agent_active_conversations",
            "slack_agent_errors_total",
            "slack_agent_commands_total",
            "slack_agent_ai_tokens_total",
            "slack_agent_ai_request_duration_seconds",
            "slack_agent_persistence_dropped_total",
            "slack_agent_uptime_seconds",
        ] {
            assert!(text.contains(&format!("# TYPE {} ", family)), "missing {}", family);
        }
        assert!(text.contains(r#"slack_agent_requests_total{endpoint="/health",status="200"} 1"#));
        assert!(text.contains(r#"slack_agent_ai_tokens_total{direction="input"} 100"#));
    }

    #[test]
    fn test_json_mirrors_text() {
        let metrics = Metrics::new().unwrap();
        metrics.record_command("help", "success");
        metrics.record_command("help", "success");
        metrics.observe_request("/slack/events", 200, Duration::from_millis(3));

        let snapshot = metrics.render_json().unwrap();
        let commands = snapshot
            .metrics
            .iter()
            .find(|m| m.name == "slack_agent_commands_total")
            .unwrap();
        assert_eq!(commands.metric_type, "counter");
        assert_eq!(commands.samples.len(), 1);
        assert_eq!(commands.samples[0].labels["command"], "help");
        assert_eq!(commands.samples[0].value, 2.0);

        let histogram = snapshot
            .metrics
            .iter()
            .find(|m| m.name == "slack_agent_request_duration_seconds")
            .unwrap();
        assert_eq!(histogram.metric_type, "histogram");
        assert!(histogram
            .samples
            .iter()
            .any(|s| s.name.ends_with("_count") && s.value == 1.0));
    }

    #[test]
    fn test_parse_labels_with_escapes() {
        let labels = parse_labels(r#"a="x\"y",b="z""#);
        assert_eq!(labels["a"], "x\"y");
        assert_eq!(labels["b"], "z");
    }
}
