//! BigQuery 数据仓库
//!
//! 通过 `tabledata.insertAll` 流式插入，服务账号 JWT 换取 OAuth2 access token。
//! `insertId` 使用记录 ID，BigQuery 据此做尽力而为的去重。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::model::{ConversationRecord, GeneratedCodeRecord, MetricRecord, new_record_id};
use super::{StoreError, Warehouse};
use crate::common::truncate_with_ellipsis;
use crate::http_client::build_client;
use crate::model::config::Config;

const DEFAULT_API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
const SCOPE: &str = "https://www.googleapis.com/auth/bigquery.insertdata https://www.googleapis.com/auth/bigquery.readonly";
/// token 提前刷新的余量
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// 服务账号密钥（GOOGLE_APPLICATION_CREDENTIALS_JSON 的内容）
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// BigQuery 数据仓库
pub struct BigQueryWarehouse {
    client: Client,
    api_base: String,
    project_id: String,
    dataset: String,
    location: String,
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    token: Mutex<Option<CachedToken>>,
}

impl BigQueryWarehouse {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let raw = config
            .google_credentials_json
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("GOOGLE_APPLICATION_CREDENTIALS_JSON 未配置"))?;
        let key: ServiceAccountKey = serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("服务账号 JSON 解析失败: {}", e))?;

        let project_id = config
            .bigquery_project_id
            .clone()
            .or_else(|| key.project_id.clone())
            .ok_or_else(|| anyhow::anyhow!("BIGQUERY_PROJECT_ID 未配置"))?;
        let dataset = config
            .bigquery_dataset
            .clone()
            .ok_or_else(|| anyhow::anyhow!("BIGQUERY_DATASET 未配置"))?;

        let client = build_client(config.proxy_url.as_deref(), 30)?;
        Self::new(client, key, project_id, dataset, config.bigquery_location.clone())
    }

    pub fn new(
        client: Client,
        key: ServiceAccountKey,
        project_id: String,
        dataset: String,
        location: String,
    ) -> anyhow::Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| anyhow::anyhow!("服务账号私钥无效: {}", e))?;
        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            project_id,
            dataset,
            location,
            key,
            encoding_key,
            token: Mutex::new(None),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// 获取 access token，过期前 60 秒刷新
    async fn access_token(&self) -> Result<String, StoreError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: SCOPE,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        let assertion = jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|e| StoreError::Auth(e.to_string()))?;

        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Auth(format!(
                "token endpoint returned {}: {}",
                status,
                truncate_with_ellipsis(&body, 200)
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Auth(e.to_string()))?;

        tracing::debug!(expires_in = token.expires_in, "已获取 BigQuery access token");
        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }

    fn dataset_url(&self) -> String {
        format!(
            "{}/projects/{}/datasets/{}",
            self.api_base, self.project_id, self.dataset
        )
    }

    /// 流式插入，rows 为 (insertId, json)
    async fn insert_all(&self, table: &str, rows: Vec<(String, Value)>) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let count = rows.len();
        let body = json!({
            "kind": "bigquery#tableDataInsertAllRequest",
            "skipInvalidRows": false,
            "ignoreUnknownValues": false,
            "rows": rows
                .into_iter()
                .map(|(id, row)| json!({"insertId": id, "json": row}))
                .collect::<Vec<_>>(),
        });

        let token = self.access_token().await?;
        let url = format!("{}/tables/{}/insertAll", self.dataset_url(), table);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Http {
                status: status.as_u16(),
                message: truncate_with_ellipsis(&text, 300),
            });
        }

        let parsed: Value = serde_json::from_str(&text)?;
        if let Some(errors) = parsed.get("insertErrors").and_then(|v| v.as_array()) {
            if !errors.is_empty() {
                return Err(StoreError::InsertErrors(truncate_with_ellipsis(
                    &Value::Array(errors.clone()).to_string(),
                    500,
                )));
            }
        }

        tracing::debug!(table, rows = count, "BigQuery 写入完成");
        Ok(())
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn insert_conversations(&self, records: &[ConversationRecord]) -> Result<(), StoreError> {
        let rows = records
            .iter()
            .map(|r| Ok((r.id.clone(), serde_json::to_value(r)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.insert_all("conversations", rows).await
    }

    async fn insert_metrics(&self, records: &[MetricRecord]) -> Result<(), StoreError> {
        let rows = records
            .iter()
            .map(|r| {
                let mut row = serde_json::to_value(r)?;
                // labels 以 JSON 字符串列存储
                row["labels"] = Value::String(serde_json::to_string(&r.labels)?);
                Ok((new_record_id(), row))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.insert_all("metrics", rows).await
    }

    async fn insert_generated_code(
        &self,
        records: &[GeneratedCodeRecord],
    ) -> Result<(), StoreError> {
        let rows = records
            .iter()
            .map(|r| Ok((r.id.clone(), serde_json::to_value(r)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.insert_all("generated_code", rows).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.dataset_url())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Http {
                status: status.as_u16(),
                message: format!("dataset {} not reachable ({})", self.dataset, self.location),
            });
        }
        Ok(())
    }
}
