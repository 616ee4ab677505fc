//! 双层语义缓存：环境指纹、L1 感知缓存、L2 动作缓存、参数差分与替换
//!
//! 缓存永远不会让步骤失败：后端错误一律按未命中处理。

pub mod action;
pub mod fingerprint;
pub mod params;
pub mod perception;
pub mod vector;

use thiserror::Error;

pub use action::{ActionCache, ActionEntry, FacetScores, RetrievalResult, StoreOutcome, VerifiedScript};
pub use fingerprint::{is_blank_source, normalize_source, EnvironmentSnapshot, Fingerprinter};
pub use params::{diff, substitute, substitute_with_report, ParamDiff, SubstitutionReport};
pub use perception::{CacheStats, InMemoryPerceptionStore, PerceptionCache, PerceptionEntry, PerceptionStore};
pub use vector::{cosine_similarity, InMemoryVectorStore, VectorStore};

/// 缓存后端错误（调用方按未命中处理）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("entry not found: {0}")]
    NotFound(String),
}

impl From<StoreError> for crate::core::AgentError {
    fn from(e: StoreError) -> Self {
        crate::core::AgentError::RetrievalDegraded(e.to_string())
    }
}
