//! 长消息拆分
//!
//! Slack 单条消息上限约 4000 字符，这里按更保守的上限拆分：
//! 普通文本 3000 字符，含代码块 2900 字符。拆分后的每一段（含分段标记）
//! 都不超过上限，代码块在每一段内保持闭合。

use std::sync::LazyLock;

use regex::Regex;

pub const MAX_TEXT_LENGTH: usize = 3000;
pub const MAX_CODE_LENGTH: usize = 2900;

/// 为 "\n\n(Part 99/99) (continued)" 预留
const INDICATOR_RESERVE: usize = 32;

static CODE_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```([\w+#.-]*)\n(.*?)\n?```").ok());

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// 消息拆分器
#[derive(Debug, Clone)]
pub struct MessageSplitter {
    max_text_length: usize,
    max_code_length: usize,
}

impl Default for MessageSplitter {
    fn default() -> Self {
        Self::new(MAX_TEXT_LENGTH, MAX_CODE_LENGTH)
    }
}

impl MessageSplitter {
    pub fn new(max_text_length: usize, max_code_length: usize) -> Self {
        Self {
            max_text_length: max_text_length.max(INDICATOR_RESERVE * 2),
            max_code_length: max_code_length.max(INDICATOR_RESERVE * 2),
        }
    }

    fn limit_for(&self, message: &str) -> usize {
        if message.contains("```") {
            self.max_code_length
        } else {
            self.max_text_length
        }
    }

    pub fn needs_splitting(&self, message: &str) -> bool {
        char_len(message) > self.limit_for(message)
    }

    /// 拆分消息，不需要拆分时原样返回单段
    pub fn split(&self, message: &str) -> Vec<String> {
        if !self.needs_splitting(message) {
            return vec![message.to_string()];
        }

        let budget = self.limit_for(message) - INDICATOR_RESERVE;
        let mut packer = Packer::new(budget);

        match CODE_BLOCK.as_ref() {
            Some(re) if message.contains("```") => {
                let mut last = 0;
                for caps in re.captures_iter(message) {
                    let Some(whole) = caps.get(0) else { continue };
                    pack_text(&mut packer, &message[last..whole.start()]);
                    let lang = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                    let code = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                    pack_code_block(&mut packer, whole.as_str(), lang, code);
                    last = whole.end();
                }
                pack_text(&mut packer, &message[last..]);
            }
            _ => pack_text(&mut packer, message),
        }

        let parts = packer.finish();
        tracing::debug!(
            chars = char_len(message),
            parts = parts.len(),
            "长消息已拆分"
        );
        add_part_indicators(parts)
    }
}

/// 贪心装箱：放不下时开新段
struct Packer {
    budget: usize,
    parts: Vec<String>,
    current: String,
    current_len: usize,
}

impl Packer {
    fn new(budget: usize) -> Self {
        Self {
            budget,
            parts: Vec::new(),
            current: String::new(),
            current_len: 0,
        }
    }

    /// `piece` 长度必须不超过 budget
    fn push(&mut self, piece: &str, separator: &str) {
        let piece_len = char_len(piece);
        if piece_len == 0 {
            return;
        }
        let needed = if self.current.is_empty() {
            piece_len
        } else {
            self.current_len + char_len(separator) + piece_len
        };
        if needed > self.budget {
            self.flush();
        }
        if !self.current.is_empty() {
            self.current.push_str(separator);
            self.current_len += char_len(separator);
        }
        self.current.push_str(piece);
        self.current_len += piece_len;
    }

    fn flush(&mut self) {
        let trimmed = self.current.trim();
        if !trimmed.is_empty() {
            self.parts.push(trimmed.to_string());
        }
        self.current.clear();
        self.current_len = 0;
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.parts
    }
}

/// 先按段落，段落过长再按句子，句子仍过长则硬切
fn pack_text(packer: &mut Packer, text: &str) {
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim_matches('\n');
        if paragraph.trim().is_empty() {
            continue;
        }
        if char_len(paragraph) <= packer.budget {
            packer.push(paragraph, "\n\n");
            continue;
        }

        let mut first = true;
        for sentence in paragraph.split_inclusive(". ") {
            let separator = if first { "\n\n" } else { "" };
            first = false;
            if char_len(sentence) <= packer.budget {
                packer.push(sentence, separator);
            } else {
                for chunk in hard_split(sentence, packer.budget) {
                    packer.push(&chunk, separator);
                }
            }
        }
    }
}

/// 代码块放不下时按行拆成多个闭合的代码块
fn pack_code_block(packer: &mut Packer, block: &str, lang: &str, code: &str) {
    if char_len(block) <= packer.budget {
        packer.push(block, "\n");
        return;
    }

    let open = format!("```{}\n", lang);
    let close = "\n```";
    let frame = char_len(&open) + char_len(close);
    let line_budget = packer.budget.saturating_sub(frame).max(1);

    let mut chunks: Vec<String> = Vec::new();
    for line in code.split('\n') {
        if char_len(line) > line_budget {
            chunks.extend(hard_split(line, line_budget));
        } else {
            chunks.push(line.to_string());
        }
    }

    let emit = |packer: &mut Packer, lines: &[&str]| {
        if !lines.is_empty() {
            let body = format!("{}{}{}", open, lines.join("\n"), close);
            packer.push(&body, "\n");
        }
    };
    let mut lines: Vec<&str> = Vec::new();
    let mut lines_len = 0;
    for line in &chunks {
        let added = char_len(line) + usize::from(!lines.is_empty());
        if lines_len + added > line_budget {
            emit(packer, &lines);
            // 每个代码块独占一段，避免与后续内容混排时超限
            packer.flush();
            lines.clear();
            lines_len = 0;
        }
        lines_len += char_len(line) + usize::from(!lines.is_empty());
        lines.push(line);
    }
    emit(packer, &lines);
}

/// 按字符数硬切
fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

fn add_part_indicators(parts: Vec<String>) -> Vec<String> {
    let total = parts.len();
    if total <= 1 {
        return parts;
    }
    parts
        .into_iter()
        .enumerate()
        .map(|(i, part)| {
            let index = i + 1;
            if index < total {
                format!("{}\n\n(Part {}/{}) (continued)", part, index, total)
            } else {
                format!("{}\n\n(Part {}/{})", part, index, total)
            }
        })
        .collect()
}
