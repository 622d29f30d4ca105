//! Slack Events API / Slash Command 类型定义

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// === Events API ===

/// 事件信封（url_verification / event_callback）
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type", default)]
    pub envelope_type: Option<String>,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub event: Option<SlackEvent>,
}

impl EventEnvelope {
    /// 握手请求：显式 url_verification，或没有 type 但携带 challenge
    pub fn challenge(&self) -> Option<&str> {
        match self.envelope_type.as_deref() {
            Some("url_verification") | None => self.challenge.as_deref(),
            _ => None,
        }
    }
}

/// 消息事件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channel_type: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
}

impl SlackEvent {
    /// 机器人自己（或其他 bot）发出的消息，以及编辑、删除等带 subtype 的消息
    pub fn is_from_bot(&self) -> bool {
        self.bot_id.is_some() || self.subtype.is_some()
    }

    /// 需要处理的事件：@提及，或私聊消息
    pub fn is_actionable(&self) -> bool {
        match self.event_type.as_str() {
            "app_mention" => true,
            "message" => self.channel_type.as_deref() == Some("im"),
            _ => false,
        }
    }
}

/// 事件确认响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub status: AckStatus,
    pub message_id: String,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Ignored,
    Duplicate,
}

impl AckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Ignored => "ignored",
            Self::Duplicate => "duplicate",
        }
    }
}

// === Slash Command ===

/// Slash command 表单
#[derive(Debug, Clone, Default)]
pub struct SlashCommand {
    pub command: String,
    pub text: String,
    pub user_id: String,
    pub channel_id: String,
    pub response_url: Option<String>,
}

impl SlashCommand {
    /// 解析 `application/x-www-form-urlencoded` 请求体
    pub fn parse(body: &str) -> Option<Self> {
        let fields = parse_form(body);
        let command = fields.get("command")?.clone();
        Some(Self {
            command,
            text: fields.get("text").cloned().unwrap_or_default(),
            user_id: fields.get("user_id").cloned().unwrap_or_default(),
            channel_id: fields.get("channel_id").cloned().unwrap_or_default(),
            response_url: fields.get("response_url").filter(|s| !s.is_empty()).cloned(),
        })
    }

    /// 合并为分发器输入，例如 `/analyze` + `python ...` → `/analyze python ...`
    pub fn dispatch_input(&self) -> String {
        let text = self.text.trim();
        if text.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, text)
        }
    }
}

/// 表单解码，`+` 视为空格
pub fn parse_form(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(&key.replace('+', " ")).ok()?.into_owned();
            let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

/// Slash command 即时响应
#[derive(Debug, Clone, Serialize)]
pub struct SlashResponse {
    pub response_type: &'static str,
    pub text: String,
}

impl SlashResponse {
    pub fn ephemeral(text: impl Into<String>) -> Self {
        Self {
            response_type: "ephemeral",
            text: text.into(),
        }
    }
}

// === Web API ===

/// Slack Web API 通用响应
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
}
