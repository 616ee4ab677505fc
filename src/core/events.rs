//! 编排过程事件：阶段切换、缓存命中、暂停、步骤结果，可序列化为 JSON 供上层展示

use serde::Serialize;

use crate::core::state::{PausePoint, StepOutcome};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// 进入新阶段
    PhaseEntered {
        session_id: String,
        phase: String,
        seq: u64,
    },
    PerceptionCacheHit { fingerprint: String },
    PerceptionCacheMiss { fingerprint: String },
    ActionCacheHit { entry_id: String, score: f32 },
    ActionCacheMiss,
    /// 复用脚本时做的参数替换
    ParametersSubstituted { replacements: usize, skipped: usize },
    Paused { session_id: String, point: PausePoint },
    StepOutcome { outcome: StepOutcome, summary: String },
    /// 外部调用的审计（与日志中的 script_audit 对应）
    CapabilityCall {
        capability: String,
        ok: bool,
        duration_ms: u64,
    },
    KnowledgeAnswer { preview: String },
    Error { text: String },
}
