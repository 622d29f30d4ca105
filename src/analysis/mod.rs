//! 静态代码分析（基于正则的启发式规则）
//!
//! 只做轻量统计：行数、函数/类/导入数量、圈复杂度估算和常见问题提示，
//! 结果用于 `/test/code-analysis` 与生成代码记录的质量评分。

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// 超过该长度的行会被提示
const LONG_LINE_CHARS: usize = 120;

/// 代码度量
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CodeMetrics {
    pub lines: usize,
    pub non_empty_lines: usize,
    pub comment_lines: usize,
    pub functions: usize,
    pub classes: usize,
    pub imports: usize,
    pub cyclomatic_complexity: u32,
    /// 0-100，按注释比例估算
    pub maintainability_index: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
}

/// 单条问题提示
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    /// 从 1 开始
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// 分析结果
#[derive(Debug, Clone, Serialize)]
pub struct CodeAnalysis {
    pub language: String,
    pub metrics: CodeMetrics,
    pub findings: Vec<Finding>,
    pub estimated_complexity: Complexity,
    /// 0-100
    pub quality_score: u8,
}

/// 语言规则
struct Rules {
    comment_prefixes: &'static [&'static str],
    function: Option<Regex>,
    class: Option<Regex>,
    import: Option<Regex>,
    branch: Option<Regex>,
}

impl Rules {
    fn new(
        comment_prefixes: &'static [&'static str],
        function: &str,
        class: &str,
        import: &str,
        branch: &str,
    ) -> Self {
        Self {
            comment_prefixes,
            function: Regex::new(function).ok(),
            class: Regex::new(class).ok(),
            import: Regex::new(import).ok(),
            branch: Regex::new(branch).ok(),
        }
    }

    fn is_comment(&self, trimmed: &str) -> bool {
        self.comment_prefixes.iter().any(|p| trimmed.starts_with(p))
    }
}

const C_BRANCHES: &str = r"\b(?:if|for|while|case|catch)\b|&&|\|\|";

static PYTHON: LazyLock<Rules> = LazyLock::new(|| {
    Rules::new(
        &["#"],
        r"(?m)^\s*(?:async\s+)?def\s+\w+",
        r"(?m)^\s*class\s+\w+",
        r"(?m)^\s*(?:import|from)\s+[\w.]+",
        r"\b(?:if|elif|for|while|except|and|or)\b",
    )
});

static JAVASCRIPT: LazyLock<Rules> = LazyLock::new(|| {
    Rules::new(
        &["//", "/*", "*"],
        r"\bfunction\b|\b(?:const|let|var)\s+\w+\s*=\s*(?:async\s*)?(?:\([^)]*\)|\w+)\s*=>",
        r"\bclass\s+\w+",
        r"(?m)^\s*import\b|\brequire\(",
        C_BRANCHES,
    )
});

static JAVA_LIKE: LazyLock<Rules> = LazyLock::new(|| {
    Rules::new(
        &["//", "/*", "*"],
        r"(?m)^\s*(?:(?:public|private|protected|static|final|virtual|override|async)\s+)+[\w<>\[\],\s]*?\w+\s*\([^;]*$",
        r"\b(?:class|interface|struct)\s+\w+",
        r"(?m)^\s*(?:import|using|#include)\b",
        C_BRANCHES,
    )
});

static RUST: LazyLock<Rules> = LazyLock::new(|| {
    Rules::new(
        &["//"],
        r"\bfn\s+\w+",
        r"\b(?:struct|enum|trait)\s+\w+",
        r"(?m)^\s*use\s+",
        r"\b(?:if|for|while|loop|match)\b|=>|&&|\|\||\?;",
    )
});

static GO: LazyLock<Rules> = LazyLock::new(|| {
    Rules::new(
        &["//", "/*"],
        r"(?m)^\s*func\b",
        r"(?m)^\s*type\s+\w+\s+(?:struct|interface)\b",
        r#"(?m)^\s*import\b|^\s*"[\w./-]+"\s*$"#,
        r"\b(?:if|for|case|select)\b|&&|\|\|",
    )
});

static GENERIC: LazyLock<Rules> = LazyLock::new(|| {
    Rules::new(
        &["#", "//", "--"],
        r"\b(?:def|function|func|fn)\s+\w+",
        r"\bclass\s+\w+",
        r"(?m)^\s*(?:import|require|use|include)\b",
        r"\b(?:if|elif|elsif|for|while|case|when|catch|except)\b|&&|\|\|",
    )
});

static TODO_MARKER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(?:TODO|FIXME|XXX)\b").ok());
static JS_VAR: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\bvar\s+\w").ok());
static PY_DEF: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*(?:async\s+)?def\s+(\w+)").ok());

fn rules_for(language: &str) -> &'static Rules {
    match language {
        "python" => &PYTHON,
        "javascript" | "typescript" => &JAVASCRIPT,
        "java" | "csharp" | "kotlin" | "cpp" | "c" | "swift" | "php" => &JAVA_LIKE,
        "rust" => &RUST,
        "go" => &GO,
        _ => &GENERIC,
    }
}

fn count(re: &Option<Regex>, code: &str) -> usize {
    re.as_ref().map(|re| re.find_iter(code).count()).unwrap_or(0)
}

fn is_match(re: &Option<Regex>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

/// 分析一段代码，`language` 应为规范化后的语言标签
pub fn analyze(code: &str, language: &str) -> CodeAnalysis {
    let rules = rules_for(language);
    let lines: Vec<&str> = code.lines().collect();

    let mut non_empty = 0;
    let mut comments = 0;
    let mut code_only = String::with_capacity(code.len());
    for line in &lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        non_empty += 1;
        if rules.is_comment(trimmed) {
            comments += 1;
        } else {
            code_only.push_str(line);
            code_only.push('\n');
        }
    }

    let maintainability_index = if non_empty == 0 {
        0.0
    } else {
        (comments as f64 / non_empty as f64 * 200.0).min(100.0)
    };

    let metrics = CodeMetrics {
        lines: lines.len(),
        non_empty_lines: non_empty,
        comment_lines: comments,
        functions: count(&rules.function, &code_only),
        classes: count(&rules.class, &code_only),
        imports: count(&rules.import, &code_only),
        cyclomatic_complexity: 1 + count(&rules.branch, &code_only) as u32,
        maintainability_index,
    };

    let findings = find_issues(&lines, language);
    let estimated_complexity = estimate_complexity(&metrics);
    let quality_score = quality_score(&metrics, &findings);

    CodeAnalysis {
        language: language.to_string(),
        metrics,
        findings,
        estimated_complexity,
        quality_score,
    }
}

fn find_issues(lines: &[&str], language: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut push = |severity, line: usize, message: String| {
        findings.push(Finding {
            severity,
            line: line + 1,
            message,
        });
    };

    for (i, line) in lines.iter().enumerate() {
        if line.chars().count() > LONG_LINE_CHARS {
            push(
                Severity::Info,
                i,
                format!("Line is longer than {} characters", LONG_LINE_CHARS),
            );
        }
        if is_match(&TODO_MARKER, line) {
            push(Severity::Info, i, "Unresolved TODO/FIXME marker".to_string());
        }

        match language {
            "javascript" | "typescript" => {
                if is_match(&JS_VAR, line) {
                    push(
                        Severity::Warning,
                        i,
                        "Prefer 'let' or 'const' over 'var'".to_string(),
                    );
                }
                if line.contains("console.log") {
                    push(
                        Severity::Info,
                        i,
                        "Remove console.log before shipping".to_string(),
                    );
                }
            }
            "python" => {
                if line.trim() == "except:" {
                    push(
                        Severity::Warning,
                        i,
                        "Bare 'except:' catches every exception".to_string(),
                    );
                }
                if let Some(name) = PY_DEF
                    .as_ref()
                    .and_then(|re| re.captures(line))
                    .and_then(|c| c.get(1))
                {
                    if !python_has_docstring(lines, i) {
                        push(
                            Severity::Warning,
                            i,
                            format!("Function '{}' should have a docstring", name.as_str()),
                        );
                    }
                }
            }
            "rust" => {
                if line.contains(".unwrap()") {
                    push(
                        Severity::Info,
                        i,
                        "'.unwrap()' panics on error; consider propagating with '?'".to_string(),
                    );
                }
            }
            _ => {}
        }
    }
    findings
}

/// def 行（可能跨多行，直到以 `:` 结尾）之后的第一条非空语句是否为文档字符串
fn python_has_docstring(lines: &[&str], def_line: usize) -> bool {
    let mut body_start = def_line;
    while body_start < lines.len() && !lines[body_start].trim_end().ends_with(':') {
        body_start += 1;
    }
    lines
        .iter()
        .skip(body_start + 1)
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .is_some_and(|l| l.starts_with("\"\"\"") || l.starts_with("'''"))
}

fn estimate_complexity(metrics: &CodeMetrics) -> Complexity {
    match (metrics.cyclomatic_complexity, metrics.non_empty_lines) {
        (cc, _) if cc > 15 => Complexity::High,
        (_, n) if n > 300 => Complexity::High,
        (cc, _) if cc > 5 => Complexity::Medium,
        (_, n) if n > 100 => Complexity::Medium,
        _ => Complexity::Low,
    }
}

fn quality_score(metrics: &CodeMetrics, findings: &[Finding]) -> u8 {
    if metrics.non_empty_lines == 0 {
        return 0;
    }

    let warnings = findings
        .iter()
        .filter(|f| f.severity == Severity::Warning)
        .count() as i64;
    let infos = findings.len() as i64 - warnings;

    let mut score: i64 = 100;
    score -= (warnings * 5).min(40);
    score -= infos.min(15);
    score -= (i64::from(metrics.cyclomatic_complexity) - 10).clamp(0, 15) * 2;
    if metrics.non_empty_lines > 20 && metrics.comment_lines == 0 {
        score -= 10;
    }
    score.clamp(0, 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_metrics() {
        let code = r#"import os
from typing import List

# helpers
class Greeter:
    def greet(self, name):
        """Say hello."""
        if name and name.strip():
            return "hi " + name
        return "hi"

def main():
    for n in ["a", "b"]:
        print(Greeter().greet(n))
"#;
        let analysis = analyze(code, "python");
        let m = &analysis.metrics;
        assert_eq!(m.imports, 2);
        assert_eq!(m.classes, 1);
        assert_eq!(m.functions, 2);
        assert_eq!(m.comment_lines, 1);
        // if + and + for
        assert_eq!(m.cyclomatic_complexity, 4);
        assert_eq!(analysis.estimated_complexity, Complexity::Low);

        // main 缺少 docstring，greet 有
        let docstring: Vec<_> = analysis
            .findings
            .iter()
            .filter(|f| f.message.contains("docstring"))
            .collect();
        assert_eq!(docstring.len(), 1);
        assert_eq!(docstring[0].line, 12);
    }

    #[test]
    fn test_javascript_findings() {
        let code = "var x = 1;\nconst add = (a, b) => a + b;\nfunction log(v) {\n  console.log(v);\n}\n";
        let analysis = analyze(code, "javascript");
        assert_eq!(analysis.metrics.functions, 2);
        assert!(
            analysis
                .findings
                .iter()
                .any(|f| f.severity == Severity::Warning && f.line == 1)
        );
        assert!(
            analysis
                .findings
                .iter()
                .any(|f| f.message.contains("console.log") && f.line == 4)
        );
    }

    #[test]
    fn test_comments_not_counted_as_code() {
        let code = "// if (x) { fn fake() }\nfn real() {}\n";
        let analysis = analyze(code, "rust");
        assert_eq!(analysis.metrics.functions, 1);
        assert_eq!(analysis.metrics.cyclomatic_complexity, 1);
        assert_eq!(analysis.metrics.comment_lines, 1);
    }

    #[test]
    fn test_complexity_and_score_degrade() {
        let simple = analyze("def add(a, b):\n    \"\"\"Add.\"\"\"\n    return a + b\n", "python");
        assert_eq!(simple.quality_score, 100);

        let branches = "if a:\n    pass\n".repeat(20);
        let complex = analyze(&branches, "python");
        assert_eq!(complex.estimated_complexity, Complexity::High);
        assert!(complex.quality_score < simple.quality_score);
    }

    #[test]
    fn test_empty_code_scores_zero() {
        let analysis = analyze("   \n\n", "go");
        assert_eq!(analysis.metrics.non_empty_lines, 0);
        assert_eq!(analysis.quality_score, 0);
        assert_eq!(analysis.metrics.maintainability_index, 0.0);
    }
}
