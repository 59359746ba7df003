//! 上下文压缩
//!
//! 按「约 4 字符 / token」估算；未超预算时原样返回。超出时保留前 50 行与后 50 行，
//! 中间替换为显式截断标记；若仍超出，再按字符保留首尾。有损但保序，不做摘要。
//! 压缩结果再次压缩不会变化（幂等），长度也不会增加。

/// 截断标记（单独一行）
pub const TRUNCATION_MARKER: &str = "... [truncated for token efficiency] ...";

const CHARS_PER_TOKEN: usize = 4;
const KEEP_HEAD_LINES: usize = 50;
const KEEP_TAIL_LINES: usize = 50;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn estimate(text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }

    /// token 预算对应的字符上限
    pub fn char_budget(max_tokens: usize) -> usize {
        max_tokens.saturating_mul(CHARS_PER_TOKEN)
    }
}

#[derive(Debug, Clone)]
pub struct ContextCompressor {
    max_tokens: usize,
}

impl ContextCompressor {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// 使用默认预算压缩
    pub fn compress(&self, context: &str) -> String {
        Self::compress_with(context, self.max_tokens)
    }

    pub fn compress_with(context: &str, max_tokens: usize) -> String {
        let max_chars = TokenEstimator::char_budget(max_tokens);
        if context.chars().count() < max_chars {
            return context.to_string();
        }

        let lines: Vec<&str> = context.lines().collect();
        let mut out = if lines.len() > KEEP_HEAD_LINES + KEEP_TAIL_LINES + 1 {
            let mut kept: Vec<&str> = Vec::with_capacity(KEEP_HEAD_LINES + KEEP_TAIL_LINES + 1);
            kept.extend_from_slice(&lines[..KEEP_HEAD_LINES]);
            kept.push(TRUNCATION_MARKER);
            kept.extend_from_slice(&lines[lines.len() - KEEP_TAIL_LINES..]);
            kept.join("\n")
        } else {
            context.to_string()
        };

        let len = out.chars().count();
        if len >= max_chars {
            // 首尾各 keep 个字符 + 两个换行 + 标记，总长严格小于 max_chars
            let overhead = TRUNCATION_MARKER.chars().count() + 3;
            let keep = max_chars.saturating_sub(overhead) / 2;
            let head: String = out.chars().take(keep).collect();
            let tail: String = out.chars().skip(len - keep).collect();
            let candidate = format!("{head}\n{TRUNCATION_MARKER}\n{tail}");
            if candidate.chars().count() < len {
                out = candidate;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn many_lines(n: usize, width: usize) -> String {
        (0..n)
            .map(|i| format!("{i:04} {}", "x".repeat(width)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_below_threshold_is_noop() {
        let c = ContextCompressor::new(100);
        let text = "short context\nsecond line";
        assert_eq!(c.compress(text), text);
    }

    #[test]
    fn test_keeps_first_and_last_fifty_lines() {
        let text = many_lines(300, 20);
        let out = ContextCompressor::compress_with(&text, 1000);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 101);
        assert!(lines[0].starts_with("0000"));
        assert!(lines[49].starts_with("0049"));
        assert_eq!(lines[50], TRUNCATION_MARKER);
        assert!(lines[51].starts_with("0250"));
        assert!(lines[100].starts_with("0299"));
    }

    #[test]
    fn test_falls_back_to_char_truncation() {
        let text = many_lines(300, 200);
        let out = ContextCompressor::compress_with(&text, 200);
        assert!(out.chars().count() < 800);
        assert!(out.contains(TRUNCATION_MARKER));
        assert!(out.starts_with("0000"));
    }

    #[test]
    fn test_compress_is_idempotent() {
        for (text, budget) in [
            (many_lines(300, 20), 1000),
            (many_lines(300, 200), 200),
            (many_lines(80, 500), 300),
            ("y".repeat(50_000), 100),
            ("tiny".repeat(10), 2),
        ] {
            let once = ContextCompressor::compress_with(&text, budget);
            let twice = ContextCompressor::compress_with(&once, budget);
            assert!(once.chars().count() <= text.chars().count());
            assert!(twice.chars().count() <= once.chars().count());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_multibyte_text_is_safe() {
        let text = "上下文压缩".repeat(2000);
        let out = ContextCompressor::compress_with(&text, 100);
        assert!(out.chars().count() < 400);
    }

    #[test]
    fn test_estimate() {
        assert_eq!(TokenEstimator::estimate("abcd"), 1);
        assert_eq!(TokenEstimator::estimate("abcde"), 2);
        assert_eq!(TokenEstimator::estimate(""), 0);
    }
}
