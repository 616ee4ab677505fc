//! 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 MicroRetry / Replan / SkipCache / Abort。

use thiserror::Error;

/// 编排过程中可能出现的错误
///
/// 前四类对应步骤失败的语义分类；其余为基础设施错误。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 可在本步骤内重试的执行错误（生成脚本的语法、名称、类型错误）
    #[error("Transient execution error: {0}")]
    TransientExecution(String),

    /// 环境与复用的感知结果不一致（元素找不到、过期引用）
    #[error("Environment mismatch: {0}")]
    EnvironmentMismatch(String),

    /// 缓存后端或嵌入不可用，按未命中处理
    #[error("Retrieval degraded: {0}")]
    RetrievalDegraded(String),

    /// 有界重试耗尽或循环预算用尽
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    /// 外部能力（规划、感知、生成、执行、判定、知识库）返回的错误
    #[error("Capability {capability} failed: {message}")]
    Capability {
        capability: &'static str,
        message: String,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Invalid directive: {0}")]
    InvalidDirective(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    pub fn capability(capability: &'static str, message: impl Into<String>) -> Self {
        AgentError::Capability {
            capability,
            message: message.into(),
        }
    }
}

impl From<crate::core::checkpoint::CheckpointError> for AgentError {
    fn from(e: crate::core::checkpoint::CheckpointError) -> Self {
        AgentError::Checkpoint(e.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 回到生成阶段，把错误信息注入下一次生成
    MicroRetry(String),
    /// 回到规划阶段；invalidate_perception 为 true 时先重新观察并丢弃复用的感知结果
    Replan { invalidate_perception: bool },
    /// 本轮跳过缓存，走完整路径
    SkipCache,
    /// 终止当前任务（进入 Error，断点仍可恢复）
    Abort,
}
