//! 嵌入 API：供动作缓存的三维检索使用，调用 OpenAI 兼容的 /embeddings 端点

use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use super::openai::{openai_config, resolve_api_key};

/// 嵌入提供方：文本 → 向量；失败时返回错误字符串
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str) -> Self {
        Self {
            client: Client::with_config(openai_config(base_url, api_key.to_string())),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![]);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| e.to_string())?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;
        Ok(response
            .data
            .first()
            .map(|e| e.embedding.clone())
            .unwrap_or_default())
    }
}

/// 从应用配置创建嵌入提供方；未配置 API Key 时返回 None
pub fn create_embedder_from_config(
    embedding: &crate::config::EmbeddingSection,
    llm: &crate::config::LlmSection,
) -> Option<Arc<dyn EmbeddingProvider>> {
    if llm.provider == "mock" {
        return None;
    }
    let Some(key) = resolve_api_key(llm.api_key.as_deref()) else {
        tracing::debug!("embedding skipped: no OPENAI_API_KEY");
        return None;
    };
    let base_url = embedding.base_url.as_deref().or(llm.base_url.as_deref());
    Some(Arc::new(OpenAiEmbedder::new(base_url, &embedding.model, &key)))
}
