//! 公共工具模块

pub mod auth;
pub mod rate_limit;

/// 安全地截断 UTF-8 字符串，确保不会在多字节字符中间截断
///
/// 返回不超过 `max_bytes` 字节的最长有效 UTF-8 子串
pub fn truncate_str_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    // 从 max_bytes 位置向前查找有效的字符边界
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    &s[..end]
}

/// 安全地截断字符串并添加省略号后缀
pub fn truncate_with_ellipsis(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    // 为省略号预留空间
    let truncate_at = if max_bytes > 3 { max_bytes - 3 } else { max_bytes };
    let truncated = truncate_str_safe(s, truncate_at);
    format!("{}...", truncated)
}

/// 日志中输出的文本预览
///
/// 启用 `sensitive-logs` 时返回完整文本，否则截断到 120 字节
pub fn log_preview(s: &str) -> String {
    if cfg!(feature = "sensitive-logs") {
        s.to_string()
    } else {
        truncate_with_ellipsis(s, 120)
    }
}

/// 当前 Unix 时间戳（秒）
pub fn unix_now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundary() {
        // "é" 占 2 字节，截断到 1 字节时不能切开
        assert_eq!(truncate_str_safe("é", 1), "");
        assert_eq!(truncate_str_safe("abc", 10), "abc");
        assert_eq!(truncate_str_safe("héllo", 2), "h");
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
        assert_eq!(truncate_with_ellipsis("hello world", 8), "hello...");
    }
}
