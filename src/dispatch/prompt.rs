//! Prompt 模板

use super::command::{Command, CommandArgs};

/// 系统提示词
pub const SYSTEM_PROMPT: &str = "You are an expert programming assistant with deep knowledge of \
every mainstream programming language, answering inside a Slack workspace.

You help with:
- Generating efficient, well-documented code that follows the idioms of its language
- Analyzing code quality, complexity, performance and security issues
- Writing thorough unit tests including edge cases
- Debugging errors and explaining their root cause
- Reviewing, documenting and refactoring existing code

Rules:
- Explain your reasoning briefly and concretely
- Always put code in fenced code blocks tagged with the language
- Handle errors and edge cases in the code you write
- Use Slack-compatible markdown (*bold*, `code`, ```blocks```), no tables or HTML
- Keep answers focused; prefer a short answer with working code over a long essay";

/// 未指定语言时生成代码使用的默认语言
pub const DEFAULT_LANGUAGE: &str = "python";

/// 构造命令对应的用户提示词
pub fn build_prompt(command: Command, args: &CommandArgs) -> String {
    let language = args.language.as_deref();
    let lang_label = language.unwrap_or("the given");
    let input = args.text.trim();

    match command {
        Command::Help => String::new(),
        Command::Generate => format!(
            "Write {} code for the following requirements:\n\n{}\n\n\
             Provide:\n1. The complete, working code in one fenced code block\n\
             2. A short explanation of how it works\n3. A usage example",
            language.unwrap_or(DEFAULT_LANGUAGE),
            input
        ),
        Command::Analyze => format!(
            "Analyze this {} code:\n\n{}\n\n\
             Cover:\n1. Basic metrics (size, estimated complexity, overall quality)\n\
             2. Structure and logic\n3. Potential bugs, performance and security problems\n\
             4. Concrete suggestions for improvement",
            lang_label, input
        ),
        Command::Explain => format!(
            "Explain what this {} code does, step by step, for a developer who has not seen it \
             before:\n\n{}",
            lang_label, input
        ),
        Command::Optimize => format!(
            "Optimize this {} code for performance and resource usage. Show the optimized code \
             and explain each change and its expected impact:\n\n{}",
            lang_label, input
        ),
        Command::Debug => format!(
            "Debug the following {} problem. Identify the root cause, show the corrected code \
             and explain the fix:\n\n{}",
            lang_label, input
        ),
        Command::Review => format!(
            "Review this {} code for quality and best practices:\n\n{}\n\n\
             Evaluate:\n1. Code quality and readability\n2. Best practices of the language\n\
             3. Security\n4. Performance\n5. Maintainability\n\
             Finish with a score from 0 to 100 and a prioritized list of improvements.",
            lang_label, input
        ),
        Command::Test => format!(
            "Write unit tests for this {} code using the standard testing framework of the \
             language. Cover normal cases, edge cases and error cases:\n\n{}",
            lang_label, input
        ),
        Command::Document => format!(
            "Write documentation for this {} code: idiomatic doc comments or docstrings for \
             every public item and a short usage section. Return the documented code:\n\n{}",
            lang_label, input
        ),
        Command::Refactor => format!(
            "Refactor this {} code for readability and maintainability without changing its \
             behavior. Show the refactored code and summarize the changes:\n\n{}",
            lang_label, input
        ),
    }
}

/// 普通提问
pub fn build_general_prompt(question: &str) -> String {
    format!(
        "Answer this question from a developer helpfully and specifically. If code helps, \
         include it:\n\n{}",
        question.trim()
    )
}

/// help 响应文本
pub fn help_text() -> String {
    let mut lines = vec![
        "*Code assistant* - mention me or send a direct message with a command:".to_string(),
        String::new(),
    ];
    for command in Command::ALL {
        lines.push(format!("• `{}` - {}", command.as_str(), command.description()));
    }
    lines.push(String::new());
    lines.push(
        "Put an optional language first and wrap code in ``` fences, e.g. \
         `analyze python ```def f(x): return x*2````"
            .to_string(),
    );
    lines.join("\n")
}
