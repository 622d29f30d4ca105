//! 命令解析

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// 支持的命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Help,
    Analyze,
    Generate,
    Explain,
    Optimize,
    Debug,
    Review,
    Test,
    Document,
    Refactor,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::Help,
        Command::Analyze,
        Command::Generate,
        Command::Explain,
        Command::Optimize,
        Command::Debug,
        Command::Review,
        Command::Test,
        Command::Document,
        Command::Refactor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Analyze => "analyze",
            Self::Generate => "generate",
            Self::Explain => "explain",
            Self::Optimize => "optimize",
            Self::Debug => "debug",
            Self::Review => "review",
            Self::Test => "test",
            Self::Document => "document",
            Self::Refactor => "refactor",
        }
    }

    /// 大小写不敏感匹配，`code` 是 `generate` 的别名
    pub fn from_word(word: &str) -> Option<Self> {
        let word = word.to_ascii_lowercase();
        if word == "code" {
            return Some(Self::Generate);
        }
        Self::ALL.into_iter().find(|c| c.as_str() == word)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Help => "Show this help message",
            Self::Analyze => "Analyze code quality, complexity and potential issues",
            Self::Generate => "Generate code from a description",
            Self::Explain => "Explain what a piece of code does",
            Self::Optimize => "Suggest performance optimizations",
            Self::Debug => "Find the cause of an error and propose a fix",
            Self::Review => "Review code for best practices and security",
            Self::Test => "Write unit tests for code",
            Self::Document => "Write documentation and docstrings",
            Self::Refactor => "Refactor code for readability and maintainability",
        }
    }

    /// 参数为空时的用法提示
    pub fn usage(&self) -> String {
        let example = match self {
            Self::Help => return "Usage: `help`".to_string(),
            Self::Generate => "python a function that validates email addresses",
            Self::Debug => "python ```<code>``` TypeError: 'NoneType' object is not subscriptable",
            _ => "python ```<code>```",
        };
        format!("Usage: `{} [language] <input>`\nExample: `{} {}`", self.as_str(), self.as_str(), example)
    }

    /// 分析类命令使用低温度，生成类命令使用默认温度
    pub fn temperature(&self) -> Option<f32> {
        match self {
            Self::Analyze | Self::Review | Self::Debug | Self::Explain | Self::Test => Some(0.1),
            _ => None,
        }
    }

    /// 是否产出代码（用于记录 generated_code）
    pub fn produces_code(&self) -> bool {
        matches!(
            self,
            Self::Generate | Self::Optimize | Self::Refactor | Self::Test | Self::Document
        )
    }
}

/// 支持的语言标签
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "python",
    "javascript",
    "typescript",
    "java",
    "rust",
    "go",
    "c",
    "cpp",
    "csharp",
    "ruby",
    "php",
    "kotlin",
    "swift",
    "sql",
    "bash",
];

/// 规范化语言标签，未知返回 None
pub fn normalize_language(tag: &str) -> Option<&'static str> {
    let tag = tag.trim().to_ascii_lowercase();
    let canonical = match tag.as_str() {
        "py" => "python",
        "js" | "node" => "javascript",
        "ts" => "typescript",
        "rs" => "rust",
        "golang" => "go",
        "c++" => "cpp",
        "c#" | "cs" => "csharp",
        "rb" => "ruby",
        "sh" | "shell" => "bash",
        other => other,
    };
    SUPPORTED_LANGUAGES.iter().copied().find(|l| *l == canonical)
}

static LEADING_MENTIONS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*(?:<@[A-Z0-9]+(?:\|[^>]*)?>\s*)+").ok());

static CODE_FENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:([\w+#-]+)[ \t]*\n)?(.*?)```").ok());

/// 去掉开头的 `<@U123>` 提及
pub fn strip_mentions(text: &str) -> &str {
    match LEADING_MENTIONS.as_ref().and_then(|re| re.find(text)) {
        Some(m) => &text[m.end()..],
        None => text,
    }
}

/// 提取第一个代码块，返回（语言标签，代码）
pub fn extract_code_block(text: &str) -> Option<(Option<String>, String)> {
    let caps = CODE_FENCE.as_ref()?.captures(text)?;
    let lang = caps
        .get(1)
        .map(|m| m.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let code = caps.get(2)?.as_str().trim_matches('\n').to_string();
    Some((lang, code))
}

/// 解析后的命令参数
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandArgs {
    /// 规范化后的语言标签
    pub language: Option<String>,
    /// 去掉语言标签后的完整参数文本
    pub text: String,
    /// 代码块内容（如有）
    pub code: Option<String>,
}

impl CommandArgs {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// 分发器输入解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedInput {
    /// 识别的命令
    Command(Command, CommandArgs),
    /// 以 `/` 开头但不认识的命令
    Unknown(String),
    /// 非命令的普通文本
    FreeText(String),
    Empty,
}

/// 解析用户输入
pub fn parse(input: &str) -> ParsedInput {
    let text = strip_mentions(input).trim();
    if text.is_empty() {
        return ParsedInput::Empty;
    }

    let (is_slash, body) = match text.strip_prefix('/') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, text),
    };

    let (word, rest) = match body.find(char::is_whitespace) {
        Some(idx) => (&body[..idx], body[idx..].trim_start()),
        None => (body, ""),
    };

    match Command::from_word(word) {
        Some(command) => ParsedInput::Command(command, parse_args(rest)),
        None if is_slash => ParsedInput::Unknown(word.to_string()),
        None => ParsedInput::FreeText(text.to_string()),
    }
}

/// 可选的语言标签作为首个 token，随后是参数文本
pub fn parse_args(rest: &str) -> CommandArgs {
    let rest = rest.trim();
    let (first, after) = match rest.find(char::is_whitespace) {
        Some(idx) => (&rest[..idx], rest[idx..].trim_start()),
        None => (rest, ""),
    };

    let (mut language, text) = match normalize_language(first) {
        Some(lang) => (Some(lang.to_string()), after.to_string()),
        None => (None, rest.to_string()),
    };

    let code = extract_code_block(&text).map(|(fence_lang, code)| {
        if language.is_none() {
            language = fence_lang
                .as_deref()
                .and_then(normalize_language)
                .map(|l| l.to_string());
        }
        code
    });

    CommandArgs {
        language,
        text,
        code,
    }
}
