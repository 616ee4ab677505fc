//! 参数差分与替换
//!
//! 缓存命中的脚本是为旧任务写的。diff 对比旧任务与新任务的文本，得到 (旧值, 新值) 对；
//! substitute 只在脚本的字符串字面量内部替换，不改动代码结构。替换可以是部分的：找不到的旧值跳过。
//!
//! 对齐方式：按词元做最长公共子序列（后缀 DP，前向回溯，相等长度时先删后插），
//! 连续的非公共片段组成一对差异；两侧去掉首尾停用词后都非空才输出。

use std::sync::OnceLock;

use jieba_rs::Jieba;
use serde::{Deserialize, Serialize};

static JIEBA: OnceLock<Jieba> = OnceLock::new();

pub(crate) fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

const STOPWORDS: [&str; 24] = [
    "the", "a", "an", "to", "for", "of", "in", "on", "at", "and", "with", "by", "please", "then", "into", "from",
    "的", "了", "在", "和", "把", "请", "并", "再",
];

/// 一对参数差异
pub type ParamDiff = (String, String);

/// 替换报告
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstitutionReport {
    /// (旧值, 新值, 替换次数)
    pub applied: Vec<(String, String, usize)>,
    /// 在任何字面量中都没找到的差异
    pub skipped: Vec<ParamDiff>,
}

impl SubstitutionReport {
    pub fn total_replacements(&self) -> usize {
        self.applied.iter().map(|(_, _, n)| n).sum()
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

fn is_word_char(c: char) -> bool {
    (c.is_alphanumeric() && !is_cjk(c)) || matches!(c, '_' | '.' | '-' | ':' | '/')
}

fn closing_quote(c: char) -> Option<char> {
    match c {
        '"' => Some('"'),
        '\'' => Some('\''),
        '`' => Some('`'),
        '“' => Some('”'),
        '‘' => Some('’'),
        '「' => Some('」'),
        '《' => Some('》'),
        _ => None,
    }
}

fn is_stopword(token: &str) -> bool {
    STOPWORDS.iter().any(|s| s.eq_ignore_ascii_case(token))
}

/// 分词：引号内整体作为一个词元；CJK 片段用 jieba 切分；其余按非单词字符切分
fn tokenize(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let prev_is_alnum = i > 0 && chars[i - 1].is_alphanumeric();
        if let Some(close) = closing_quote(c).filter(|_| !(c == '\'' && prev_is_alnum)) {
            if let Some(offset) = chars[i + 1..].iter().position(|&x| x == close) {
                let literal: String = chars[i + 1..i + 1 + offset].iter().collect();
                let literal = literal.trim();
                if !literal.is_empty() {
                    tokens.push(literal.to_string());
                }
                i += offset + 2;
                continue;
            }
            i += 1;
            continue;
        }
        if is_cjk(c) {
            let start = i;
            while i < chars.len() && is_cjk(chars[i]) {
                i += 1;
            }
            let run: String = chars[start..i].iter().collect();
            tokens.extend(
                get_jieba()
                    .cut(&run, false)
                    .into_iter()
                    .filter(|t| !t.trim().is_empty())
                    .map(str::to_string),
            );
            continue;
        }
        if is_word_char(c) {
            let start = i;
            while i < chars.len() && is_word_char(chars[i]) {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let word = word.trim_matches(|ch| matches!(ch, '.' | '-' | ':' | '/'));
            if !word.is_empty() {
                tokens.push(word.to_string());
            }
            continue;
        }
        i += 1;
    }
    tokens
}

fn same_token(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// 拼接词元：两侧都是 ASCII 字母数字时加空格，否则直接相连
fn join_tokens(tokens: &[String]) -> String {
    let mut out = String::new();
    for t in tokens {
        let needs_space = match (out.chars().last(), t.chars().next()) {
            (Some(a), Some(b)) => !is_cjk(a) && !is_cjk(b),
            _ => false,
        };
        if needs_space {
            out.push(' ');
        }
        out.push_str(t);
    }
    out
}

fn trim_stopwords(tokens: &[String]) -> &[String] {
    let start = tokens.iter().position(|t| !is_stopword(t)).unwrap_or(tokens.len());
    let end = tokens.iter().rposition(|t| !is_stopword(t)).map(|p| p + 1).unwrap_or(start);
    &tokens[start..end.max(start)]
}

/// 对比缓存任务与新任务，返回有序的 (旧值, 新值) 列表
pub fn diff(cached_task: &str, new_task: &str) -> Vec<ParamDiff> {
    let a = tokenize(cached_task);
    let b = tokenize(new_task);
    let (n, m) = (a.len(), b.len());

    // lcs[i][j] = a[i..] 与 b[j..] 的 LCS 长度
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if same_token(&a[i], &b[j]) {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut diffs = Vec::new();
    let mut removed: Vec<String> = Vec::new();
    let mut added: Vec<String> = Vec::new();
    let mut push = |pair: ParamDiff| {
        if pair.0 != pair.1 && !diffs.contains(&pair) {
            diffs.push(pair);
        }
    };
    // 等长的替换段逐词配对，脚本里各字面量可以分别命中；长度不同才整段配对
    let mut flush = |removed: &mut Vec<String>, added: &mut Vec<String>| {
        let old = trim_stopwords(removed);
        let new = trim_stopwords(added);
        if old.len() > 1 && old.len() == new.len() {
            for (o, n) in old.iter().zip(new) {
                if !is_stopword(o) && !is_stopword(n) && !same_token(o, n) {
                    push((o.clone(), n.clone()));
                }
            }
        } else if !old.is_empty() && !new.is_empty() {
            push((join_tokens(old), join_tokens(new)));
        }
        removed.clear();
        added.clear();
    };

    let (mut i, mut j) = (0, 0);
    while i < n || j < m {
        if i < n && j < m && same_token(&a[i], &b[j]) {
            flush(&mut removed, &mut added);
            i += 1;
            j += 1;
        } else if j >= m || (i < n && lcs[i + 1][j] >= lcs[i][j + 1]) {
            removed.push(a[i].clone());
            i += 1;
        } else {
            added.push(b[j].clone());
            j += 1;
        }
    }
    flush(&mut removed, &mut added);
    diffs
}

/// 只在字符串字面量内部替换；总是返回结果（可能与原脚本相同）
pub fn substitute(script: &str, diffs: &[ParamDiff]) -> String {
    substitute_with_report(script, diffs).0
}

pub fn substitute_with_report(script: &str, diffs: &[ParamDiff]) -> (String, SubstitutionReport) {
    let mut ordered: Vec<&ParamDiff> = diffs.iter().filter(|(old, _)| !old.is_empty()).collect();
    // 长的旧值优先，避免被其前缀抢先匹配
    ordered.sort_by(|x, y| y.0.chars().count().cmp(&x.0.chars().count()));
    let mut counts = vec![0usize; ordered.len()];

    let chars: Vec<char> = script.chars().collect();
    let mut out = String::with_capacity(script.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        // 字面量外的行注释原样输出
        let line_comment = c == '#' || (c == '/' && chars.get(i + 1) == Some(&'/'));
        if line_comment {
            while i < chars.len() && chars[i] != '\n' {
                out.push(chars[i]);
                i += 1;
            }
            continue;
        }
        if matches!(c, '"' | '\'' | '`') {
            let mut end = i + 1;
            while end < chars.len() && chars[end] != c {
                if chars[end] == '\\' {
                    end += 1;
                }
                end += 1;
            }
            if end >= chars.len() {
                // 未闭合：原样输出剩余部分
                out.extend(&chars[i..]);
                break;
            }
            out.push(c);
            out.push_str(&replace_in_literal(&chars[i + 1..end], &ordered, &mut counts));
            out.push(c);
            i = end + 1;
            continue;
        }
        out.push(c);
        i += 1;
    }

    let mut report = SubstitutionReport::default();
    for (pair, count) in ordered.iter().zip(counts) {
        if count > 0 {
            report.applied.push((pair.0.clone(), pair.1.clone(), count));
        } else {
            report.skipped.push((*pair).clone());
        }
    }
    if !report.applied.is_empty() {
        tracing::debug!(replacements = report.total_replacements(), "parameters substituted");
    }
    (out, report)
}

fn boundary_ok(outer: Option<&char>, inner: Option<char>) -> bool {
    match (outer, inner) {
        (Some(o), Some(i)) => !(o.is_ascii_alphanumeric() && i.is_ascii_alphanumeric()),
        _ => true,
    }
}

fn replace_in_literal(content: &[char], diffs: &[&ParamDiff], counts: &mut [usize]) -> String {
    let mut out = String::with_capacity(content.len());
    let mut i = 0;
    'scan: while i < content.len() {
        for (k, (old, new)) in diffs.iter().enumerate() {
            let old_chars: Vec<char> = old.chars().collect();
            let end = i + old_chars.len();
            if end > content.len() || content[i..end] != old_chars[..] {
                continue;
            }
            let before = if i == 0 { None } else { content.get(i - 1) };
            if !boundary_ok(before, old_chars.first().copied())
                || !boundary_ok(content.get(end), old_chars.last().copied())
            {
                continue;
            }
            out.push_str(new);
            counts[k] += 1;
            i = end;
            continue 'scan;
        }
        // 转义序列整体保留
        if content[i] == '\\' && i + 1 < content.len() {
            out.push(content[i]);
            out.push(content[i + 1]);
            i += 2;
            continue;
        }
        out.push(content[i]);
        i += 1;
    }
    out
}
