//! HTTP 层错误类型
//!
//! 所有对外错误统一序列化为 `{"error": {"type": ..., "message": ...}}`

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::anthropic::AiError;

/// API 错误响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// 错误详情
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }
}

/// 应用错误
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 签名或 API Key 校验失败
    #[error("{0}")]
    Authentication(String),

    /// 请求参数无效
    #[error("{0}")]
    InvalidRequest(String),

    /// 超出速率限制
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// 上游 AI 调用失败
    #[error("Upstream AI error: {0}")]
    Upstream(#[from] AiError),

    /// 依赖不可用（队列已满等）
    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// 错误类型标识（同时用于 errors_total 指标的 type 标签）
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication_error",
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::Upstream(_) => "api_error",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn authentication() -> Self {
        Self::Authentication("Invalid API key".to_string())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(format!("Invalid JSON body: {}", rejection.body_text()))
    }
}

/// 写入响应扩展的错误类型，供请求指标中间件统计 errors_total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorKind(pub &'static str);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let kind = ErrorKind(self.error_type());
        let body = ErrorResponse::new(self.error_type(), self.to_string());

        if status.is_server_error() {
            tracing::error!(error_type = body.error.error_type, "{}", body.error.message);
        } else {
            tracing::warn!(error_type = body.error.error_type, "{}", body.error.message);
        }

        let mut response = (status, Json(body)).into_response();
        response.extensions_mut().insert(kind);
        if let Self::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.max(1).to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}
