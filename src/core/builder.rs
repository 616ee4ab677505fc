//! 编排器构建器：统一的初始化逻辑
//!
//! 未显式提供的组件按配置创建；没有 API Key 时 LLM 与嵌入退回 Mock，环境退回演练环境。

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cache::{ActionCache, InMemoryVectorStore, PerceptionCache, VectorStore};
use crate::capability::{Capabilities, DryRunEnvironment, ExecutionCapability, InMemoryKnowledgeStore, KnowledgeStore};
use crate::config::AppConfig;
use crate::core::checkpoint::{create_checkpoint_store, CheckpointStore};
use crate::core::events::EngineEvent;
use crate::core::orchestrator::Orchestrator;
use crate::core::AgentError;
use crate::llm::{create_embedder_from_config, create_llm_from_config, EmbeddingProvider, LlmClient, MockEmbedder, MockLlmClient};

/// 动作缓存的默认容量
const DEFAULT_VECTOR_CAPACITY: usize = 5000;

/// Mock LLM 的默认回复：直接声明完成，避免离线运行时空转
const MOCK_FALLBACK_REPLY: &str = "【任务已完成】\n(mock) 未配置 LLM，未执行任何操作。";

pub struct EngineBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    environment: Option<Arc<dyn ExecutionCapability>>,
    knowledge: Option<Arc<dyn KnowledgeStore>>,
    capabilities: Option<Capabilities>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    perception_cache: Option<Arc<PerceptionCache>>,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            embedder: None,
            environment: None,
            knowledge: None,
            capabilities: None,
            checkpoints: None,
            vector_store: None,
            perception_cache: None,
            events: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_environment(mut self, environment: Arc<dyn ExecutionCapability>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    /// 直接提供全部外部能力（忽略 with_llm / with_environment / with_knowledge）
    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.capabilities = Some(caps);
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    /// 共享 L1 缓存（多个编排器实例复用同一份感知结果）
    pub fn with_perception_cache(mut self, cache: Arc<PerceptionCache>) -> Self {
        self.perception_cache = Some(cache);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn build_llm(&self) -> Arc<dyn LlmClient> {
        if let Some(llm) = &self.llm {
            return llm.clone();
        }
        match create_llm_from_config(&self.config.llm) {
            Some(llm) => {
                tracing::info!(model = %self.config.llm.model, "Using OpenAI-compatible LLM");
                llm
            }
            None => {
                tracing::warn!("No API key set or provider is mock, using Mock LLM");
                Arc::new(MockLlmClient::new(MOCK_FALLBACK_REPLY))
            }
        }
    }

    fn build_embedder(&self) -> Arc<dyn EmbeddingProvider> {
        if let Some(embedder) = &self.embedder {
            return embedder.clone();
        }
        create_embedder_from_config(&self.config.embedding, &self.config.llm).unwrap_or_else(|| {
            tracing::warn!("No embedding backend configured, using bag-of-words mock embedder");
            Arc::new(MockEmbedder::default())
        })
    }

    fn build_environment(&self) -> Arc<dyn ExecutionCapability> {
        if let Some(env) = &self.environment {
            return env.clone();
        }
        #[cfg(feature = "browser")]
        {
            Arc::new(crate::capability::ChromeEnvironment::new())
        }
        #[cfg(not(feature = "browser"))]
        {
            tracing::warn!("browser feature disabled, scripts run in dry-run mode");
            let env = match &self.config.app.start_url {
                Some(url) => DryRunEnvironment::new().with_start_url(url.clone()),
                None => DryRunEnvironment::new(),
            };
            Arc::new(env)
        }
    }

    pub fn build(self) -> Result<Orchestrator, AgentError> {
        let caps = match self.capabilities.clone() {
            Some(caps) => caps,
            None => {
                let knowledge = self
                    .knowledge
                    .clone()
                    .unwrap_or_else(|| Arc::new(InMemoryKnowledgeStore::default()));
                Capabilities::from_llm(self.build_llm(), self.build_environment(), knowledge)
            }
        };

        let checkpoints = match self.checkpoints.clone() {
            Some(store) => store,
            None => Arc::from(create_checkpoint_store(&self.config.checkpoint)?),
        };
        let perception_cache = self.perception_cache.clone().unwrap_or_else(|| {
            Arc::new(PerceptionCache::from_config(&self.config.perception_cache))
        });
        let vector_store = self
            .vector_store
            .clone()
            .unwrap_or_else(|| Arc::new(InMemoryVectorStore::new(DEFAULT_VECTOR_CAPACITY)));
        let action_cache = Arc::new(ActionCache::new(
            vector_store,
            self.build_embedder(),
            self.config.action_cache.clone(),
        ));

        tracing::info!(
            checkpoint_backend = %self.config.checkpoint.backend,
            l1 = perception_cache.is_enabled(),
            l2 = action_cache.is_enabled(),
            "orchestrator ready"
        );

        let orchestrator = Orchestrator::new(caps, perception_cache, action_cache, checkpoints, &self.config);
        Ok(match self.events {
            Some(tx) => orchestrator.with_events(tx),
            None => orchestrator,
        })
    }
}
