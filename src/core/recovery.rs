//! 错误恢复引擎
//!
//! 根据 AgentError 类型与当前重试计数返回 RecoveryAction，供编排状态机决定是微重试、重新规划、跳过缓存还是终止。

use crate::config::OrchestratorSection;
use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_micro_retries: u32,
    max_step_failures: u32,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(&OrchestratorSection::default())
    }
}

impl RecoveryEngine {
    pub fn new(settings: &OrchestratorSection) -> Self {
        Self {
            max_micro_retries: settings.max_micro_retries,
            max_step_failures: settings.max_step_failures.max(1),
        }
    }

    /// micro_retries：本步骤已做的微重试次数；step_failures：含本次在内的连续失败次数
    pub fn handle(&self, err: &AgentError, micro_retries: u32, step_failures: u32) -> RecoveryAction {
        if matches!(err, AgentError::Cancelled | AgentError::Unrecoverable(_)) {
            return RecoveryAction::Abort;
        }
        if step_failures >= self.max_step_failures {
            return RecoveryAction::Abort;
        }
        match err {
            AgentError::TransientExecution(msg) if micro_retries < self.max_micro_retries => {
                RecoveryAction::MicroRetry(format!(
                    "上一次生成的脚本执行出错: {msg}。请修正该错误后重新输出完整脚本。"
                ))
            }
            AgentError::EnvironmentMismatch(_) => RecoveryAction::Replan {
                invalidate_perception: true,
            },
            AgentError::RetrievalDegraded(_) => RecoveryAction::SkipCache,
            AgentError::Checkpoint(_) | AgentError::ConfigError(_) => RecoveryAction::Abort,
            _ => RecoveryAction::Replan {
                invalidate_perception: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RecoveryEngine {
        RecoveryEngine::default()
    }

    #[test]
    fn test_recovery_transient_micro_retry() {
        let action = engine().handle(&AgentError::TransientExecution("SyntaxError".into()), 0, 1);
        match action {
            RecoveryAction::MicroRetry(msg) => assert!(msg.contains("SyntaxError")),
            other => panic!("Expected MicroRetry, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_transient_exhausted_replans() {
        let action = engine().handle(&AgentError::TransientExecution("x".into()), 3, 1);
        assert_eq!(
            action,
            RecoveryAction::Replan {
                invalidate_perception: false
            }
        );
    }

    #[test]
    fn test_recovery_environment_mismatch_invalidates() {
        let action = engine().handle(&AgentError::EnvironmentMismatch("gone".into()), 0, 1);
        assert_eq!(
            action,
            RecoveryAction::Replan {
                invalidate_perception: true
            }
        );
    }

    #[test]
    fn test_recovery_degraded_skips_cache() {
        let action = engine().handle(&AgentError::RetrievalDegraded("down".into()), 0, 0);
        assert_eq!(action, RecoveryAction::SkipCache);
    }

    #[test]
    fn test_recovery_budget_exhausted_aborts() {
        let action = engine().handle(&AgentError::Timeout("execution".into()), 0, 4);
        assert_eq!(action, RecoveryAction::Abort);
    }

    #[test]
    fn test_recovery_cancelled() {
        assert_eq!(engine().handle(&AgentError::Cancelled, 0, 0), RecoveryAction::Abort);
    }
}
