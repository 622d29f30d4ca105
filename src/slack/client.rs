//! Slack Web API 客户端

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::SlackError;
use super::types::ApiResponse;
use crate::http_client::build_client;
use crate::model::config::Config;

/// auth.test 返回的身份信息
#[derive(Debug, Clone, Default)]
pub struct BotIdentity {
    pub user_id: Option<String>,
    pub team: Option<String>,
}

/// 聊天消息发送端
#[async_trait]
pub trait ChatPoster: Send + Sync {
    /// 发送到频道（可选回复到线程），返回消息 ts
    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<Option<String>, SlackError>;

    /// 通过 slash command 的 response_url 回复
    async fn respond(&self, response_url: &str, text: &str) -> Result<(), SlackError>;

    /// 校验 token，用于健康检查
    async fn auth_test(&self) -> Result<BotIdentity, SlackError>;
}

/// 基于 reqwest 的 Slack Web API 实现
pub struct SlackApiClient {
    client: Client,
    base_url: String,
    bot_token: String,
}

impl SlackApiClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let bot_token = config
            .slack_bot_token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("SLACK_BOT_TOKEN 未配置"))?;
        Ok(Self {
            client: build_client(config.proxy_url.as_deref(), 30)?,
            base_url: config.slack_api_base_url.trim_end_matches('/').to_string(),
            bot_token,
        })
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<ApiResponse, SlackError> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SlackError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SlackError::Http(status.as_u16()));
        }

        let api: ApiResponse = response
            .json()
            .await
            .map_err(|e| SlackError::Decode(e.to_string()))?;
        if !api.ok {
            return Err(SlackError::Api(
                api.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }
        Ok(api)
    }
}

#[async_trait]
impl ChatPoster for SlackApiClient {
    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<Option<String>, SlackError> {
        let mut body = json!({
            "channel": channel,
            "text": text,
            "mrkdwn": true,
        });
        if let Some(ts) = thread_ts {
            body["thread_ts"] = json!(ts);
        }
        let api = self.call("chat.postMessage", body).await?;
        Ok(api.ts)
    }

    async fn respond(&self, response_url: &str, text: &str) -> Result<(), SlackError> {
        let response = self
            .client
            .post(response_url)
            .json(&json!({
                "response_type": "in_channel",
                "text": text,
            }))
            .send()
            .await
            .map_err(|e| SlackError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SlackError::Http(response.status().as_u16()));
        }
        Ok(())
    }

    async fn auth_test(&self) -> Result<BotIdentity, SlackError> {
        let api = self.call("auth.test", json!({})).await?;
        Ok(BotIdentity {
            user_id: api.user_id,
            team: api.team,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::HeaderMap, routing::post};

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client_for(base_url: String) -> SlackApiClient {
        let config = Config {
            slack_bot_token: Some("xoxb-test".to_string()),
            slack_api_base_url: base_url,
            ..Config::default()
        };
        SlackApiClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_post_message_in_thread() {
        let router = Router::new().route(
            "/chat.postMessage",
            post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                assert_eq!(headers.get("authorization").unwrap(), "Bearer xoxb-test");
                assert_eq!(body["channel"], "C1");
                assert_eq!(body["thread_ts"], "1.2");
                Json(json!({"ok": true, "ts": "1.3"}))
            }),
        );
        let client = client_for(spawn_server(router).await);
        let ts = client.post_message("C1", "hi", Some("1.2")).await.unwrap();
        assert_eq!(ts.as_deref(), Some("1.3"));
    }

    #[tokio::test]
    async fn test_api_error_surfaces() {
        let router = Router::new().route(
            "/chat.postMessage",
            post(|| async { Json(json!({"ok": false, "error": "channel_not_found"})) }),
        );
        let client = client_for(spawn_server(router).await);
        let err = client.post_message("C404", "hi", None).await.unwrap_err();
        assert!(matches!(err, SlackError::Api(ref e) if e == "channel_not_found"));
    }

    #[tokio::test]
    async fn test_auth_test_identity() {
        let router = Router::new().route(
            "/auth.test",
            post(|| async { Json(json!({"ok": true, "user_id": "UBOT", "team": "Acme"})) }),
        );
        let client = client_for(spawn_server(router).await);
        let identity = client.auth_test().await.unwrap();
        assert_eq!(identity.user_id.as_deref(), Some("UBOT"));
    }
}
