//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）、嵌入提供方

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use mock::{FailingEmbedder, MockEmbedder, MockLlmClient};
pub use openai::{create_llm_from_config, OpenAiClient, TokenUsage};
pub use traits::{LlmClient, Message, Role};
