//! 命令分发
//!
//! 把用户输入解析为命令，构造 prompt 调用 AI，返回面向聊天的回复文本。
//! 上游失败时返回友好的错误提示，不会 panic。

pub mod command;
pub mod context;
pub mod prompt;

use std::sync::Arc;

use crate::anthropic::{ChatMessage, CompletionClient, CompletionRequest, Usage};
use crate::store::model::ConversationStatus;

pub use command::{Command, ParsedInput};
pub use context::ContextStore;

/// 普通提问在指标中的命令名
pub const GENERAL_CHAT_COMMAND: &str = "chat";

/// 分发结果
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// 命令名（help / analyze / ... / chat）
    pub command: String,
    /// 回复文本
    pub text: String,
    pub usage: Usage,
    /// AI 调用耗时，未调用时为 0
    pub latency_ms: u64,
    pub status: ConversationStatus,
    pub error: Option<String>,
    /// 发给 AI 的用户 prompt，未调用时为空
    pub prompt: String,
    pub language: Option<String>,
    /// 回复中的代码（仅产出代码的命令）
    pub generated_code: Option<String>,
    /// 是否实际调用了 AI
    pub called_ai: bool,
}

impl DispatchOutcome {
    fn local(command: &str, text: String) -> Self {
        Self {
            command: command.to_string(),
            text,
            usage: Usage::default(),
            latency_ms: 0,
            status: ConversationStatus::Success,
            error: None,
            prompt: String::new(),
            language: None,
            generated_code: None,
            called_ai: false,
        }
    }

    fn help() -> Self {
        Self::local(Command::Help.as_str(), prompt::help_text())
    }
}

/// 命令分发器
pub struct Dispatcher {
    ai: Arc<dyn CompletionClient>,
    context: Arc<ContextStore>,
    general_chat_enabled: bool,
}

impl Dispatcher {
    pub fn new(
        ai: Arc<dyn CompletionClient>,
        context: Arc<ContextStore>,
        general_chat_enabled: bool,
    ) -> Self {
        Self {
            ai,
            context,
            general_chat_enabled,
        }
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    /// 分发一条输入
    ///
    /// `context_key` 为空时不读写对话上下文
    pub async fn dispatch(&self, input: &str, context_key: Option<&str>) -> DispatchOutcome {
        match command::parse(input) {
            ParsedInput::Empty => DispatchOutcome::help(),
            ParsedInput::Unknown(word) => {
                tracing::debug!(command = %word, "未知命令，返回帮助");
                DispatchOutcome::help()
            }
            ParsedInput::FreeText(text) => {
                if self.general_chat_enabled {
                    let user_prompt = prompt::build_general_prompt(&text);
                    self.ask(GENERAL_CHAT_COMMAND, user_prompt, None, None, context_key, &text)
                        .await
                } else {
                    DispatchOutcome::help()
                }
            }
            ParsedInput::Command(Command::Help, _) => DispatchOutcome::help(),
            ParsedInput::Command(command, args) => {
                if args.is_empty() {
                    let mut outcome = DispatchOutcome::local(command.as_str(), command.usage());
                    outcome.language = args.language;
                    return outcome;
                }
                let user_prompt = prompt::build_prompt(command, &args);
                let mut outcome = self
                    .ask(
                        command.as_str(),
                        user_prompt,
                        command.temperature(),
                        args.language.clone(),
                        context_key,
                        &args.text,
                    )
                    .await;
                if outcome.status == ConversationStatus::Success && command.produces_code() {
                    outcome.generated_code =
                        command::extract_code_block(&outcome.text).map(|(_, code)| code);
                    if outcome.language.is_none() && command == Command::Generate {
                        outcome.language = Some(prompt::DEFAULT_LANGUAGE.to_string());
                    }
                }
                outcome
            }
        }
    }

    async fn ask(
        &self,
        command: &str,
        user_prompt: String,
        temperature: Option<f32>,
        language: Option<String>,
        context_key: Option<&str>,
        raw_input: &str,
    ) -> DispatchOutcome {
        let mut messages: Vec<ChatMessage> = context_key
            .map(|key| self.context.history(key))
            .unwrap_or_default();
        messages.push(ChatMessage::user(user_prompt.clone()));

        let request = CompletionRequest {
            system: prompt::SYSTEM_PROMPT.to_string(),
            messages,
            max_tokens: None,
            temperature,
        };

        let mut outcome = DispatchOutcome {
            command: command.to_string(),
            text: String::new(),
            usage: Usage::default(),
            latency_ms: 0,
            status: ConversationStatus::Success,
            error: None,
            prompt: user_prompt,
            language,
            generated_code: None,
            called_ai: true,
        };

        match self.ai.complete(request).await {
            Ok(completion) => {
                if let Some(key) = context_key {
                    self.context.record(key, raw_input, &completion.text);
                }
                outcome.text = completion.text;
                outcome.usage = completion.usage;
                outcome.latency_ms = completion.latency_ms;
            }
            Err(e) => {
                tracing::warn!(command, kind = e.kind(), "命令处理失败: {}", e);
                outcome.text = e.user_message().to_string();
                outcome.status = ConversationStatus::Error;
                outcome.error = Some(e.to_string());
            }
        }
        outcome
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::anthropic::{AiError, Completion};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// 记录请求并返回固定结果的 AI 替身
    pub(crate) struct ScriptedAi {
        pub requests: Mutex<Vec<CompletionRequest>>,
        pub reply: Result<String, AiError>,
        /// 设置后每次调用需先取得一个许可
        pub gate: Option<Arc<tokio::sync::Semaphore>>,
    }

    impl ScriptedAi {
        pub fn replying(text: &str) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                reply: Ok(text.to_string()),
                gate: None,
            }
        }

        pub fn failing(err: AiError) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                reply: Err(err),
                gate: None,
            }
        }

        /// 调用阻塞直到返回的信号量被放入许可
        pub fn gated(text: &str) -> (Self, Arc<tokio::sync::Semaphore>) {
            let gate = Arc::new(tokio::sync::Semaphore::new(0));
            let ai = Self {
                gate: Some(gate.clone()),
                ..Self::replying(text)
            };
            (ai, gate)
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedAi {
        async fn complete(&self, request: CompletionRequest) -> Result<Completion, AiError> {
            if let Some(gate) = &self.gate {
                drop(gate.acquire().await);
            }
            self.requests.lock().push(request);
            self.reply.clone().map(|text| Completion {
                text,
                usage: Usage {
                    input_tokens: 11,
                    output_tokens: 7,
                },
                latency_ms: 5,
                model: "test-model".to_string(),
                stop_reason: Some("end_turn".to_string()),
            })
        }

        async fn ping(&self) -> Result<(), AiError> {
            Ok(())
        }

        fn model(&self) -> &str {
            "test-model"
        }
    }

    fn dispatcher(ai: Arc<ScriptedAi>, general_chat: bool) -> Dispatcher {
        Dispatcher::new(
            ai,
            Arc::new(ContextStore::new(5, Duration::from_secs(60))),
            general_chat,
        )
    }

    #[tokio::test]
    async fn test_unknown_command_equals_help() {
        let ai = Arc::new(ScriptedAi::replying("unused"));
        let d = dispatcher(ai.clone(), false);
        let help = d.dispatch("help", None).await;
        let unknown = d.dispatch("/deploy prod", None).await;
        let empty = d.dispatch("<@UBOT>", None).await;
        assert_eq!(unknown.text, help.text);
        assert_eq!(empty.text, help.text);
        assert_eq!(unknown.command, "help");
        assert_eq!(ai.calls(), 0);
    }

    #[tokio::test]
    async fn test_free_text_without_general_chat_is_help() {
        let ai = Arc::new(ScriptedAi::replying("unused"));
        let d = dispatcher(ai.clone(), false);
        let outcome = d.dispatch("what is a monad?", None).await;
        assert_eq!(outcome.text, prompt::help_text());
        assert_eq!(ai.calls(), 0);
    }

    #[tokio::test]
    async fn test_free_text_with_general_chat_calls_ai() {
        let ai = Arc::new(ScriptedAi::replying("A monad is..."));
        let d = dispatcher(ai.clone(), true);
        let outcome = d.dispatch("what is a monad?", None).await;
        assert_eq!(outcome.command, GENERAL_CHAT_COMMAND);
        assert_eq!(outcome.text, "A monad is...");
        assert_eq!(ai.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_args_returns_usage() {
        let ai = Arc::new(ScriptedAi::replying("unused"));
        let d = dispatcher(ai.clone(), false);
        let outcome = d.dispatch("analyze python", None).await;
        assert_eq!(outcome.command, "analyze");
        assert!(outcome.text.starts_with("Usage:"));
        assert!(!outcome.called_ai);
        assert_eq!(ai.calls(), 0);
    }

    #[tokio::test]
    async fn test_generate_extracts_code_and_usage() {
        let ai = Arc::new(ScriptedAi::replying(
            "Here you go:\n```python\ndef add(a, b):\n    return a + b\n```",
        ));
        let d = dispatcher(ai.clone(), false);
        let outcome = d.dispatch("<@UBOT> generate an add function", Some("C1")).await;
        assert_eq!(outcome.status, ConversationStatus::Success);
        assert_eq!(outcome.language.as_deref(), Some("python"));
        assert_eq!(
            outcome.generated_code.as_deref(),
            Some("def add(a, b):\n    return a + b")
        );
        assert_eq!(outcome.usage.total(), 18);

        let requests = ai.requests.lock();
        assert_eq!(requests[0].system, prompt::SYSTEM_PROMPT);
        assert!(requests[0].messages[0].content.contains("an add function"));
    }

    #[tokio::test]
    async fn test_context_is_replayed() {
        let ai = Arc::new(ScriptedAi::replying("answer"));
        let d = dispatcher(ai.clone(), false);
        d.dispatch("explain ```x = 1```", Some("C1:1.0")).await;
        d.dispatch("explain ```y = 2```", Some("C1:1.0")).await;

        let requests = ai.requests.lock();
        assert_eq!(requests[1].messages.len(), 3);
        assert_eq!(requests[1].messages[1].content, "answer");
        assert_eq!(requests[1].temperature, Some(0.1));
    }

    #[tokio::test]
    async fn test_upstream_error_is_user_facing() {
        let ai = Arc::new(ScriptedAi::failing(AiError::Timeout));
        let d = dispatcher(ai, false);
        let outcome = d.dispatch("debug ```boom()```", None).await;
        assert_eq!(outcome.status, ConversationStatus::Error);
        assert_eq!(outcome.text, AiError::Timeout.user_message());
        assert!(outcome.error.is_some());
    }
}
