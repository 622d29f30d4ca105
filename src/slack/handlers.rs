//! Slack 入站请求处理器
//!
//! 签名校验在解析请求体之前完成，失败时不会产生任何副作用。

use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use super::router::SlackState;
use super::signature::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use super::types::{AckResponse, AckStatus, EventEnvelope, SlashCommand, SlashResponse};
use crate::common::log_preview;
use crate::dispatch::command::strip_mentions;
use crate::error::AppError;
use crate::store::model::new_record_id;
use crate::worker::{EnqueueError, Job};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn verify_request(state: &SlackState, headers: &HeaderMap, body: &[u8]) -> Result<(), AppError> {
    state
        .verifier
        .verify(
            header(headers, TIMESTAMP_HEADER),
            header(headers, SIGNATURE_HEADER),
            body,
        )
        .map_err(|e| AppError::Authentication(format!("Invalid Slack signature: {}", e)))
}

fn enqueue_error(e: EnqueueError) -> AppError {
    AppError::ServiceUnavailable(format!("Cannot accept request now: {}", e))
}

/// POST /slack/events
pub async fn handle_events(
    State(state): State<SlackState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let started = Instant::now();
    verify_request(&state, &headers, &body)?;

    let envelope: EventEnvelope = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid event payload: {}", e)))?;

    if let Some(challenge) = envelope.challenge() {
        tracing::info!("收到 Slack URL 验证请求");
        return Ok(Json(json!({ "challenge": challenge })).into_response());
    }

    let message_id = envelope.event_id.clone().unwrap_or_else(new_record_id);
    let status = accept_event(&state, &envelope)?;
    tracing::debug!(message_id = %message_id, status = status.as_str(), "事件已确认");

    Ok(Json(AckResponse {
        status,
        message_id,
        processing_time_ms: started.elapsed().as_millis() as u64,
    })
    .into_response())
}

fn accept_event(state: &SlackState, envelope: &EventEnvelope) -> Result<AckStatus, AppError> {
    let Some(event) = envelope.event.as_ref() else {
        return Ok(AckStatus::Ignored);
    };
    if event.is_from_bot() || !event.is_actionable() {
        return Ok(AckStatus::Ignored);
    }
    let (Some(user), Some(channel)) = (event.user.as_deref(), event.channel.as_deref()) else {
        return Ok(AckStatus::Ignored);
    };

    if let Some(id) = envelope.event_id.as_deref() {
        if !state.deduper.first_seen(id) {
            tracing::debug!(event_id = %id, "重复事件，忽略");
            return Ok(AckStatus::Duplicate);
        }
    }

    let text = strip_mentions(event.text.as_deref().unwrap_or_default()).trim();
    tracing::info!(
        user = %user,
        channel = %channel,
        event_type = %event.event_type,
        text = %log_preview(text),
        "收到 Slack 消息"
    );

    let job = Job::Event {
        user: user.to_string(),
        channel: channel.to_string(),
        text: text.to_string(),
        thread_ts: event.thread_ts.clone(),
        ts: event.ts.clone(),
    };
    if let Err(e) = state.pool.try_enqueue(job) {
        if let Some(id) = envelope.event_id.as_deref() {
            state.deduper.forget(id);
        }
        return Err(enqueue_error(e));
    }
    Ok(AckStatus::Accepted)
}

/// POST /slack/commands
pub async fn handle_command(
    State(state): State<SlackState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SlashResponse>, AppError> {
    verify_request(&state, &headers, &body)?;

    let form = std::str::from_utf8(&body)
        .map_err(|_| AppError::InvalidRequest("Form body is not valid UTF-8".to_string()))?;
    let command = SlashCommand::parse(form)
        .ok_or_else(|| AppError::InvalidRequest("Missing 'command' field".to_string()))?;

    tracing::info!(
        user = %command.user_id,
        channel = %command.channel_id,
        command = %command.command,
        "收到 slash command"
    );

    let reply = format!("Working on `{}`...", command.dispatch_input());
    state
        .pool
        .try_enqueue(Job::Slash(command))
        .map_err(enqueue_error)?;
    Ok(Json(SlashResponse::ephemeral(reply)))
}
