//! 环境指纹
//!
//! 对页面结构文本做噪声归一化后取 BLAKE3 摘要：结构变化改变指纹，时间戳、计数器、空白与数字 id 的变化不改变指纹。

use std::sync::OnceLock;

use blake3::Hasher;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// 摘要长度（字节），十六进制后为 32 个字符
const DIGEST_BYTES: usize = 16;

/// 来源标识最大长度
const MAX_SOURCE_CHARS: usize = 512;

/// 一次观察得到的环境快照（不可变）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// 结构文本（DOM 骨架 / 可访问性树）
    pub structure: String,
    /// 来源标识（当前 URL）
    pub source_id: String,
    pub fingerprint: String,
}

impl EnvironmentSnapshot {
    /// 计算指纹并构造快照
    pub fn capture(structure: impl Into<String>, source_id: impl Into<String>, fingerprinter: &Fingerprinter) -> Self {
        let structure = structure.into();
        let fingerprint = fingerprinter.fingerprint(&structure);
        Self {
            structure,
            source_id: source_id.into(),
            fingerprint,
        }
    }

    /// 空白页 / 浏览器内部页：不做感知，也不查动作缓存
    pub fn is_blank(&self) -> bool {
        is_blank_source(&self.source_id)
    }
}

pub fn is_blank_source(source_id: &str) -> bool {
    let s = source_id.trim();
    s.is_empty() || s.starts_with("about:") || s.starts_with("data:") || s.starts_with("chrome://")
}

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\d{4}-\d{2}-\d{2}(?:[T ]\d{1,2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?)?|\b\d{1,2}:\d{2}(?::\d{2})?(?:\s?[AaPp][Mm])?\b",
        )
        .expect("valid timestamp regex")
    })
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("valid digits regex"))
}

fn numeric_segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/\d+(/|$)").expect("valid segment regex"))
}

/// 指纹计算器：纯函数，相同输入永远得到相同摘要
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    max_chars: usize,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self { max_chars: 20_000 }
    }
}

impl Fingerprinter {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    /// 噪声归一化：去时间戳、数字串替换为 0、压缩空白，再截断到窗口
    pub fn normalize(&self, structure: &str) -> String {
        let no_time = timestamp_re().replace_all(structure, " ");
        let no_digits = digits_re().replace_all(&no_time, "0");
        let collapsed = no_digits.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.chars().take(self.max_chars).collect()
    }

    pub fn fingerprint(&self, structure: &str) -> String {
        let normalized = self.normalize(structure);
        let mut hasher = Hasher::new();
        hasher.update(normalized.as_bytes());
        let hex = hasher.finalize().to_hex();
        hex.as_str()[..DIGEST_BYTES * 2].to_string()
    }
}

/// 来源标识归一化：去协议、`www.`、查询串与锚点，数字路径段替换为 `*`
pub fn normalize_source(source_id: &str) -> String {
    let s = source_id.trim();
    let s = s
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(s);
    let s = s.strip_prefix("www.").unwrap_or(s);
    let s = s.split(['?', '#']).next().unwrap_or("");
    let mut out = s.to_string();
    // 连续数字段共享分隔符，替换到稳定为止
    loop {
        let next = numeric_segment_re().replace_all(&out, "/*$1").to_string();
        if next == out {
            break;
        }
        out = next;
    }
    let out = out.trim_end_matches('/').to_lowercase();
    out.chars().take(MAX_SOURCE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let fp = Fingerprinter::default();
        let a = fp.fingerprint("<div><a href=x>Login</a></div>");
        let b = fp.fingerprint("<div><a href=x>Login</a></div>");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_fingerprint_ignores_volatile_noise() {
        let fp = Fingerprinter::default();
        let a = fp.fingerprint("<ul>\n  <li id=item-123>News</li>  <span>2024-05-01 12:30:00</span> <b>42 online</b></ul>");
        let b = fp.fingerprint("<ul> <li id=item-987>News</li> <span>2025-11-30 08:01:59</span>\t<b>7 online</b></ul>");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_sensitive_to_structure() {
        let fp = Fingerprinter::default();
        let a = fp.fingerprint("<form><input name=q></form>");
        let b = fp.fingerprint("<form><input name=q><button>Go</button></form>");
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_window_truncates() {
        let fp = Fingerprinter::new(10);
        assert_eq!(fp.fingerprint("abcdefghij-tail-one"), fp.fingerprint("abcdefghij-tail-two"));
    }

    #[test]
    fn test_normalize_source() {
        assert_eq!(
            normalize_source("https://www.Example.com/item/12345/reviews?page=2#top"),
            "example.com/item/*/reviews"
        );
        assert_eq!(normalize_source("http://shop.io/a/1/2/"), "shop.io/a/*/*");
    }

    #[test]
    fn test_blank_source() {
        assert!(is_blank_source("about:blank"));
        assert!(is_blank_source(""));
        assert!(is_blank_source("chrome://newtab"));
        assert!(!is_blank_source("https://example.com"));
    }
}
