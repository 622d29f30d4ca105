//! 健康检查、指标与管理端点处理器

use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};

use super::AppState;
use super::types::{
    CodeAnalysisRequest, CodeAnalysisResponse, CodeGenerationRequest, CodeGenerationResponse,
    ConfigSnapshot, HealthResponse, LogsParams, LogsResponse, PingResponse, SystemInfo,
};
use crate::analysis;
use crate::anthropic::{ChatMessage, Completion, CompletionRequest};
use crate::dispatch::command::{
    Command, CommandArgs, SUPPORTED_LANGUAGES, extract_code_block, normalize_language,
};
use crate::dispatch::prompt;
use crate::error::AppError;
use crate::health::memory_rss_bytes;
use crate::logs::{LogQuery, level_of};
use crate::store::model::{GeneratedCodeRecord, new_record_id};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1000;

/// GET /health
pub async fn get_health(State(state): State<AppState>) -> Response {
    let summary = state.health.check().await;
    let active_conversations = state.context.active_count();
    state.metrics.set_active_conversations(active_conversations);

    let code = if summary.status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: summary.status,
        timestamp: Utc::now(),
        version: VERSION,
        uptime_seconds: state.metrics.uptime().as_secs(),
        components: summary.components,
        system: SystemInfo {
            memory_rss_bytes: memory_rss_bytes(),
            active_conversations,
            queue_depth: state.pool.queue_depth(),
            worker_count: state.pool.worker_count(),
        },
    };
    (code, Json(body)).into_response()
}

/// GET /health/ping
pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        status: "ok",
        message: "pong",
        timestamp: Utc::now(),
    })
}

/// GET /metrics
pub async fn get_metrics(State(state): State<AppState>) -> Result<Response, AppError> {
    let text = state
        .metrics
        .render_text()
        .map_err(|e| AppError::Internal(format!("Failed to render metrics: {}", e)))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        text,
    )
        .into_response())
}

/// GET /metrics.json
pub async fn get_metrics_json(State(state): State<AppState>) -> Result<Response, AppError> {
    let snapshot = state
        .metrics
        .render_json()
        .map_err(|e| AppError::Internal(format!("Failed to render metrics: {}", e)))?;
    Ok(Json(snapshot).into_response())
}

/// GET /config
pub async fn get_config(State(state): State<AppState>) -> Json<ConfigSnapshot> {
    let c = &state.config;
    Json(ConfigSnapshot {
        version: VERSION,
        anthropic_model: c.anthropic_model.clone(),
        anthropic_base_url: c.anthropic_base_url.clone(),
        anthropic_max_tokens: c.anthropic_max_tokens,
        anthropic_temperature: c.anthropic_temperature,
        anthropic_timeout_secs: c.anthropic_timeout_secs,
        anthropic_api_key_configured: c.anthropic_api_key.is_some(),
        slack_bot_token_configured: c.slack_bot_token.is_some(),
        slack_signing_secret_configured: c.slack_signing_secret.is_some(),
        admin_api_key_configured: c.admin_api_key.is_some(),
        proxy_configured: c.proxy_url.is_some(),
        security_screening_configured: c.security_validator_url.is_some(),
        general_chat_enabled: c.general_chat_enabled,
        max_retries: c.max_retries,
        worker_count: c.worker_count,
        queue_capacity: c.queue_capacity,
        rate_limit_per_minute: c.rate_limit_per_minute,
        signature_tolerance_secs: c.signature_tolerance_secs,
        health_check_timeout_secs: c.health_check_timeout_secs,
        context_max_turns: c.context_max_turns,
        context_ttl_secs: c.context_ttl_secs,
        log_level: c.log_level.clone(),
        log_buffer_size: c.log_buffer_size,
        warehouse_backend: c.warehouse_backend.as_str(),
        supported_languages: SUPPORTED_LANGUAGES,
        commands: Command::ALL.iter().map(|c| c.as_str()).collect(),
    })
}

/// GET /logs
pub async fn get_logs(
    State(state): State<AppState>,
    Query(params): Query<LogsParams>,
) -> Result<Json<LogsResponse>, AppError> {
    let query = parse_logs_query(&params)?;
    let entries = state.logs.query(&query);
    Ok(Json(LogsResponse {
        total: entries.len(),
        entries,
    }))
}

fn parse_logs_query(params: &LogsParams) -> Result<LogQuery, AppError> {
    let limit = match params.limit.as_deref() {
        None | Some("") => DEFAULT_LOG_LIMIT,
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if n > 0 => n.min(MAX_LOG_LIMIT),
            _ => {
                return Err(AppError::InvalidRequest(format!(
                    "Invalid limit '{}', expected an integer between 1 and {}",
                    raw, MAX_LOG_LIMIT
                )));
            }
        },
    };

    let min_level = match params.level.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(level_of(raw).ok_or_else(|| {
            AppError::InvalidRequest(format!(
                "Invalid level '{}', expected one of trace, debug, info, warn, error",
                raw
            ))
        })?),
    };

    let since = match params.since.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|_| {
                    AppError::InvalidRequest(format!(
                        "Invalid since '{}', expected an RFC3339 timestamp",
                        raw
                    ))
                })?
                .with_timezone(&Utc),
        ),
    };

    Ok(LogQuery {
        min_level,
        since,
        limit,
    })
}

/// 测试端点的限流 key：优先使用转发头中的客户端地址
fn client_key(headers: &HeaderMap) -> String {
    let client = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .unwrap_or("local");
    format!("test:{}", client)
}

fn check_rate_limit(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    state
        .rate_limiter
        .check(&client_key(headers))
        .map_err(|e| AppError::RateLimited {
            retry_after_secs: e.retry_after.as_secs(),
        })
}

fn parse_language(raw: &str) -> Result<&'static str, AppError> {
    normalize_language(raw).ok_or_else(|| {
        AppError::InvalidRequest(format!(
            "Unsupported language '{}', expected one of: {}",
            raw,
            SUPPORTED_LANGUAGES.join(", ")
        ))
    })
}

async fn complete_command(
    state: &AppState,
    command: Command,
    args: &CommandArgs,
) -> Result<Completion, AppError> {
    let request = CompletionRequest {
        system: prompt::SYSTEM_PROMPT.to_string(),
        messages: vec![ChatMessage::user(prompt::build_prompt(command, args))],
        max_tokens: None,
        temperature: command.temperature(),
    };
    match state.ai.complete(request).await {
        Ok(completion) => {
            state.metrics.record_command(command.as_str(), "success");
            state
                .metrics
                .record_ai_call(&completion.usage, completion.latency_ms);
            Ok(completion)
        }
        Err(e) => {
            state.metrics.record_command(command.as_str(), "error");
            Err(AppError::Upstream(e))
        }
    }
}

/// POST /test/code-generation
pub async fn test_code_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CodeGenerationRequest>, JsonRejection>,
) -> Result<Json<CodeGenerationResponse>, AppError> {
    let Json(payload) = payload?;
    let requirements = payload.prompt.trim();
    if requirements.is_empty() {
        return Err(AppError::InvalidRequest("'prompt' must not be empty".to_string()));
    }
    let language = match payload.language.as_deref().filter(|l| !l.trim().is_empty()) {
        Some(raw) => parse_language(raw)?,
        None => prompt::DEFAULT_LANGUAGE,
    };
    check_rate_limit(&state, &headers)?;

    let args = CommandArgs {
        language: Some(language.to_string()),
        text: requirements.to_string(),
        code: None,
    };
    let completion = complete_command(&state, Command::Generate, &args).await?;

    let (code, explanation) = match extract_code_block(&completion.text) {
        Some((_, code)) => {
            let explanation = strip_code_block(&completion.text);
            (code, explanation)
        }
        None => (completion.text.trim().to_string(), String::new()),
    };
    let analysis = analysis::analyze(&code, language);

    if let Some(writer) = &state.writer {
        writer.record_generated_code(GeneratedCodeRecord {
            id: new_record_id(),
            user_id: None,
            prompt: requirements.to_string(),
            generated_code: code.clone(),
            language: language.to_string(),
            estimated_complexity: analysis.estimated_complexity.as_str().to_string(),
            quality_score: analysis.quality_score,
            timestamp: Utc::now(),
        });
    }

    Ok(Json(CodeGenerationResponse {
        code,
        language: language.to_string(),
        explanation,
        estimated_complexity: analysis.estimated_complexity,
        quality_score: analysis.quality_score,
        usage: completion.usage,
        latency_ms: completion.latency_ms,
    }))
}

/// 去掉第一个代码块后的说明文字
fn strip_code_block(text: &str) -> String {
    let Some(start) = text.find("```") else {
        return text.trim().to_string();
    };
    let after = &text[start + 3..];
    let end = after.find("```").map(|i| start + 3 + i + 3).unwrap_or(text.len());
    format!("{}\n{}", text[..start].trim(), text[end..].trim())
        .trim()
        .to_string()
}

/// POST /test/code-analysis
pub async fn test_code_analysis(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CodeAnalysisRequest>, JsonRejection>,
) -> Result<Json<CodeAnalysisResponse>, AppError> {
    let Json(payload) = payload?;
    if payload.code.trim().is_empty() {
        return Err(AppError::InvalidRequest("'code' must not be empty".to_string()));
    }
    let language = parse_language(&payload.language)?;
    check_rate_limit(&state, &headers)?;

    let analysis = analysis::analyze(&payload.code, language);

    let (ai_review, usage) = if payload.use_ai {
        let args = CommandArgs {
            language: Some(language.to_string()),
            text: format!("```{}\n{}\n```", language, payload.code.trim_matches('\n')),
            code: Some(payload.code.clone()),
        };
        let completion = complete_command(&state, Command::Analyze, &args).await?;
        (Some(completion.text), Some(completion.usage))
    } else {
        (None, None)
    };

    Ok(Json(CodeAnalysisResponse {
        language: language.to_string(),
        metrics: analysis.metrics,
        findings: analysis.findings,
        estimated_complexity: analysis.estimated_complexity,
        quality_score: analysis.quality_score,
        ai_review,
        usage,
    }))
}
