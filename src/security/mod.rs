//! 请求安全预检
//!
//! 转发给 AI 之前把用户输入交给外部安全分析服务判断。
//! 服务不可用、超时或返回无法识别的结果时一律放行。

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::common::log_preview;
use crate::http_client::build_client;
use crate::model::config::Config;

/// 出现在响应中即视为拒绝的关键字
const DANGER_MARKERS: [&str; 5] = ["unsafe", "dangerous", "blocked", "rejected", "malicious"];

/// 预检结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block { reason: String },
}

/// 输入预检
#[async_trait]
pub trait QueryScreener: Send + Sync {
    async fn screen(&self, text: &str) -> Verdict;
}

#[derive(Serialize)]
struct ScreenRequest<'a> {
    text: &'a str,
    agent: &'static str,
}

/// 基于 HTTP 的安全分析服务
pub struct HttpScreener {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpScreener {
    /// 未配置 `SECURITY_VALIDATOR_URL` 时返回 `None`
    pub fn from_config(config: &Config) -> anyhow::Result<Option<Self>> {
        let Some(url) = config.security_validator_url.clone() else {
            return Ok(None);
        };
        let client = build_client(
            config.proxy_url.as_deref(),
            config.security_validator_timeout_secs,
        )?;
        Ok(Some(Self {
            client,
            url,
            token: config.security_validator_token.clone(),
        }))
    }

    async fn request(&self, text: &str) -> Result<Value, String> {
        let mut request = self.client.post(&self.url).json(&ScreenRequest {
            text,
            agent: "slack-code-agent",
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                "timeout".to_string()
            } else {
                e.to_string()
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status.as_u16()));
        }
        response.json::<Value>().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl QueryScreener for HttpScreener {
    async fn screen(&self, text: &str) -> Verdict {
        match self.request(text).await {
            Ok(body) => {
                let verdict = interpret(&body);
                if let Verdict::Block { reason } = &verdict {
                    tracing::warn!(reason = %reason, "安全预检拒绝请求: {}", log_preview(text));
                }
                verdict
            }
            Err(e) => {
                tracing::warn!("安全预检服务不可用，放行请求: {}", e);
                Verdict::Allow
            }
        }
    }
}

/// 解析服务返回的判定
///
/// 依次查看 `is_safe`、`safe`、`security_score`（> 0.5 为安全）、
/// `risk_level`、`status`，都没有时再扫描危险关键字
pub fn interpret(body: &Value) -> Verdict {
    let safe = if let Some(v) = body.get("is_safe").or_else(|| body.get("safe")) {
        Some(truthy(v))
    } else if let Some(score) = body.get("security_score").and_then(number) {
        Some(score > 0.5)
    } else if let Some(level) = body.get("risk_level") {
        Some(matches!(
            lowercase(level).as_str(),
            "low" | "none" | "safe"
        ))
    } else if let Some(status) = body.get("status") {
        Some(matches!(
            lowercase(status).as_str(),
            "safe" | "ok" | "approved" | "clean"
        ))
    } else {
        let raw = body.to_string().to_lowercase();
        DANGER_MARKERS
            .iter()
            .any(|marker| raw.contains(marker))
            .then_some(false)
    };

    match safe {
        Some(false) => Verdict::Block {
            reason: body
                .get("reason")
                .or_else(|| body.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("flagged by security service")
                .to_string(),
        },
        _ => Verdict::Allow,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty() && !matches!(s.to_lowercase().as_str(), "false" | "0"),
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lowercase(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use serde_json::json;
    use std::time::Duration;

    /// 固定结论的预检替身
    pub(crate) struct StaticScreener(pub Verdict);

    #[async_trait]
    impl QueryScreener for StaticScreener {
        async fn screen(&self, _text: &str) -> Verdict {
            self.0.clone()
        }
    }

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/analyze", addr)
    }

    fn screener(url: String, timeout_secs: u64) -> HttpScreener {
        let config = Config {
            security_validator_url: Some(url),
            security_validator_token: Some("tok".to_string()),
            security_validator_timeout_secs: timeout_secs,
            ..Config::default()
        };
        HttpScreener::from_config(&config).unwrap().unwrap()
    }

    #[test]
    fn test_interpret_fields() {
        assert_eq!(interpret(&json!({"is_safe": true})), Verdict::Allow);
        assert_eq!(
            interpret(&json!({"safe": false, "reason": "prompt injection"})),
            Verdict::Block {
                reason: "prompt injection".to_string()
            }
        );
        assert_eq!(interpret(&json!({"security_score": 0.9})), Verdict::Allow);
        assert!(matches!(interpret(&json!({"security_score": "0.2"})), Verdict::Block { .. }));
        assert!(matches!(interpret(&json!({"risk_level": "HIGH"})), Verdict::Block { .. }));
        assert_eq!(interpret(&json!({"status": "approved"})), Verdict::Allow);
        assert!(matches!(
            interpret(&json!({"analysis": "content looks malicious"})),
            Verdict::Block { .. }
        ));
        assert_eq!(interpret(&json!({"analysis": "fine"})), Verdict::Allow);
    }

    #[test]
    fn test_not_configured() {
        assert!(HttpScreener::from_config(&Config::default()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_service_verdict_is_used() {
        let router = Router::new().route(
            "/analyze",
            post(|headers: axum::http::HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
                let text = body["text"].as_str().unwrap_or_default().to_string();
                Json(json!({"is_safe": !text.contains("rm -rf")}))
            }),
        );
        let s = screener(spawn_server(router).await, 5);
        assert_eq!(s.screen("explain this loop").await, Verdict::Allow);
        assert!(matches!(s.screen("run rm -rf /").await, Verdict::Block { .. }));
    }

    #[tokio::test]
    async fn test_service_errors_allow() {
        let router = Router::new()
            .route("/analyze", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let s = screener(spawn_server(router).await, 5);
        assert_eq!(s.screen("anything").await, Verdict::Allow);

        let unreachable = screener("http://127.0.0.1:9/analyze".to_string(), 1);
        assert_eq!(unreachable.screen("anything").await, Verdict::Allow);
    }

    #[tokio::test]
    async fn test_timeout_allows() {
        let router = Router::new().route(
            "/analyze",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({"is_safe": false}))
            }),
        );
        let s = screener(spawn_server(router).await, 1);
        assert_eq!(s.screen("anything").await, Verdict::Allow);
    }
}
