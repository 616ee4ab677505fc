//! 进程内知识库：按行切分写入，按词重叠检索
//!
//! 中文用 jieba 分词，其它文本按空白与标点切分；后续可换成真实向量库。

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::cache::params::get_jieba;
use crate::capability::KnowledgeStore;
use crate::core::AgentError;

#[derive(Debug, Clone)]
struct Record {
    text: String,
    source: String,
    tokens: HashSet<String>,
}

/// 简单内存实现：词重叠数即相关度
#[derive(Debug)]
pub struct InMemoryKnowledgeStore {
    records: RwLock<Vec<Record>>,
    max_records: usize,
    top_k: usize,
}

/// 小写词集合；单字符的 ASCII 词丢弃
fn tokenize_lower(s: &str) -> HashSet<String> {
    get_jieba()
        .cut(s, false)
        .into_iter()
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty() && w.chars().any(char::is_alphanumeric))
        .filter(|w| !(w.is_ascii() && w.len() < 2))
        .collect()
}

impl InMemoryKnowledgeStore {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            max_records: max_records.max(1),
            top_k: 5,
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按相关度返回前 k 条 (来源, 文本)
    pub fn search(&self, query: &str, k: usize) -> Vec<(String, String)> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let Ok(records) = self.records.read() else {
            return Vec::new();
        };
        let mut scored: Vec<(usize, &Record)> = records
            .iter()
            .map(|r| (query_tokens.intersection(&r.tokens).count(), r))
            .filter(|(s, _)| *s > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(k)
            .map(|(_, r)| (r.source.clone(), r.text.clone()))
            .collect()
    }
}

impl Default for InMemoryKnowledgeStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn store(&self, content: &str, source: &str) -> Result<usize, AgentError> {
        let new_records: Vec<Record> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| Record {
                text: l.to_string(),
                source: source.to_string(),
                tokens: tokenize_lower(l),
            })
            .collect();
        let count = new_records.len();
        let mut records = self
            .records
            .write()
            .map_err(|_| AgentError::capability("knowledge", "store lock poisoned"))?;
        records.extend(new_records);
        let n = records.len();
        if n > self.max_records {
            records.drain(0..n - self.max_records);
        }
        Ok(count)
    }

    async fn query(&self, question: &str) -> Result<String, AgentError> {
        let hits = self.search(question, self.top_k);
        if hits.is_empty() {
            return Ok("知识库中没有找到相关内容。".to_string());
        }
        Ok(hits
            .into_iter()
            .map(|(source, text)| format!("- {text} (来源: {source})"))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_splits_lines_and_query_ranks() {
        let kb = InMemoryKnowledgeStore::default();
        let n = kb
            .store("马里亚纳海沟是最深的海沟\n\n北京是中国的首都\n", "https://example.com/facts")
            .await
            .unwrap();
        assert_eq!(n, 2);
        let answer = kb.query("最深的海沟在哪里").await.unwrap();
        assert!(answer.starts_with("- 马里亚纳海沟"));
        assert!(answer.contains("https://example.com/facts"));
    }

    #[tokio::test]
    async fn test_query_without_match() {
        let kb = InMemoryKnowledgeStore::default();
        kb.store("rust ownership rules", "notes").await.unwrap();
        let answer = kb.query("python").await.unwrap();
        assert!(answer.contains("没有找到"));
    }

    #[tokio::test]
    async fn test_max_records_drops_oldest() {
        let kb = InMemoryKnowledgeStore::new(2);
        kb.store("alpha one\nbeta two\ngamma three", "s").await.unwrap();
        assert_eq!(kb.len(), 2);
        assert!(kb.search("alpha", 5).is_empty());
        assert_eq!(kb.search("gamma", 5).len(), 1);
    }
}
