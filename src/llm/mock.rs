//! Mock LLM 与嵌入（用于测试与离线运行，无需 API）
//!
//! - MockLlmClient：按顺序返回预置回复，用完后回落到默认回复；记录收到的提示
//! - MockEmbedder：词袋哈希向量，相同文本得到相同向量；可为指定文本固定向量
//! - FailingEmbedder：永远失败，用于验证缓存的降级路径

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{EmbeddingProvider, LlmClient, Message};

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<String>>,
    fallback: String,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            fallback: fallback.into(),
            ..Self::default()
        }
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(reply.into());
        }
    }

    /// 已收到的最后一条 User 消息（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::llm::Role::User))
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if let Ok(mut p) = self.prompts.lock() {
            p.push(last_user);
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

const MOCK_DIMS: usize = 64;

/// 词袋哈希嵌入：小写化、按非字母数字切分、FNV-1a 取桶
#[derive(Debug, Default)]
pub struct MockEmbedder {
    fixed: HashMap<String, Vec<f32>>,
}

impl MockEmbedder {
    pub fn with_vector(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.fixed.insert(text.into(), vector);
        self
    }

    fn bucket(token: &str) -> usize {
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in token.as_bytes() {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        (hash % MOCK_DIMS as u64) as usize
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        if let Some(v) = self.fixed.get(text) {
            return Ok(v.clone());
        }
        let mut v = vec![0.0f32; MOCK_DIMS];
        let lowered = text.to_lowercase();
        let mut any = false;
        for token in lowered.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            v[Self::bucket(token)] += 1.0;
            any = true;
        }
        if !any {
            // 空文本也给一个固定方向，避免零向量
            v[0] = 1.0;
        }
        Ok(v)
    }
}

/// 永远失败的嵌入提供方
#[derive(Debug, Default)]
pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, String> {
        Err("embedding service unavailable".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_replies_in_order_then_fallback() {
        let llm = MockLlmClient::with_replies(["one", "two"]);
        assert_eq!(llm.complete(&[Message::user("a")]).await.unwrap(), "one");
        assert_eq!(llm.complete(&[Message::user("b")]).await.unwrap(), "two");
        assert_eq!(llm.complete(&[Message::user("c")]).await.unwrap(), "");
        assert_eq!(llm.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_mock_embedder_deterministic() {
        let e = MockEmbedder::default();
        assert_eq!(e.embed("Search Sea").await.unwrap(), e.embed("search sea").await.unwrap());
        let fixed = MockEmbedder::default().with_vector("x", vec![0.5, 0.5]);
        assert_eq!(fixed.embed("x").await.unwrap(), vec![0.5, 0.5]);
    }
}
