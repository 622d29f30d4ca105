//! HTTP 中间件

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_http::cors::{Any, CorsLayer};

use super::AppState;
use crate::common::auth;
use crate::error::{AppError, ErrorKind};
use crate::metrics::Metrics;

/// 管理端点认证
///
/// 未配置 `ADMIN_API_KEY` 时直接放行
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.config.admin_api_key.as_deref() else {
        return next.run(request).await;
    };
    match auth::extract_api_key(&request) {
        Some(key) if auth::constant_time_eq(&key, expected) => next.run(request).await,
        _ => AppError::authentication().into_response(),
    }
}

/// 请求计数、耗时与错误类型统计
///
/// endpoint 标签使用路由模板，未匹配的请求统一记为 `unmatched`
pub async fn request_metrics_middleware(
    State(metrics): State<Arc<Metrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();

    let response = next.run(request).await;

    metrics.observe_request(&endpoint, response.status().as_u16(), started.elapsed());
    if let Some(ErrorKind(kind)) = response.extensions().get::<ErrorKind>() {
        metrics.record_error(kind);
    }
    response
}

/// CORS 中间件层
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}
