//! HTTP 服务入口：健康检查、指标、管理与测试端点，以及 Slack 路由

mod handlers;
mod middleware;
pub mod types;

use std::sync::Arc;

use axum::{
    Router,
    middleware as axum_middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::anthropic::CompletionClient;
use crate::common::rate_limit::RateLimiter;
use crate::dispatch::ContextStore;
use crate::health::HealthChecker;
use crate::logs::LogBuffer;
use crate::metrics::Metrics;
use crate::model::config::Config;
use crate::slack::{SlackState, create_slack_router};
use crate::store::PersistenceWriter;
use crate::worker::WorkerPool;

use handlers::{
    get_config, get_health, get_logs, get_metrics, get_metrics_json, ping, test_code_analysis,
    test_code_generation,
};
use middleware::{admin_auth_middleware, cors_layer, request_metrics_middleware};

/// 应用共享状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ai: Arc<dyn CompletionClient>,
    pub context: Arc<ContextStore>,
    pub metrics: Arc<Metrics>,
    pub health: Arc<HealthChecker>,
    pub logs: LogBuffer,
    pub pool: Arc<WorkerPool>,
    pub rate_limiter: Arc<RateLimiter>,
    pub writer: Option<Arc<PersistenceWriter>>,
}

/// 创建完整路由
///
/// # 端点
/// - `GET /health`, `GET /health/ping`
/// - `GET /metrics`（Prometheus 文本）, `GET /metrics.json`
/// - `GET /config`, `GET /logs`（需 Admin API Key）
/// - `POST /test/code-generation`, `POST /test/code-analysis`（需 Admin API Key）
/// - `POST /slack/events`, `POST /slack/commands`（Slack 签名）
pub fn create_router(state: AppState, slack: SlackState) -> Router {
    let admin = Router::new()
        .route("/config", get(get_config))
        .route("/logs", get(get_logs))
        .route("/test/code-generation", post(test_code_generation))
        .route("/test/code-analysis", post(test_code_analysis))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    let metrics = state.metrics.clone();
    Router::new()
        .route("/health", get(get_health))
        .route("/health/ping", get(ping))
        .route("/metrics", get(get_metrics))
        .route("/metrics.json", get(get_metrics_json))
        .merge(admin)
        .with_state(state)
        .nest("/slack", create_slack_router(slack))
        .layer(axum_middleware::from_fn_with_state(
            metrics,
            request_metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
}
