//! 任务状态：编排状态机的全部可持久化数据
//!
//! 每次状态转移后整体写入断点；恢复时从断点重建，不依赖进程内的任何其它状态。

use serde::{Deserialize, Serialize};

use crate::capability::{EnvironmentHandle, ExecutionResult, LocatorStrategy, Plan};

/// 暂停点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PausePoint {
    BeforeExecute,
    AfterVerify,
}

/// 知识库操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeOp {
    Store,
    Query,
}

/// 状态机阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Observe,
    Plan,
    Route,
    ActionLookup,
    Generate,
    Execute,
    Verify,
    Knowledge(KnowledgeOp),
    Paused(PausePoint),
    End,
    Error,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::End | Phase::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Observe => "observe",
            Phase::Plan => "plan",
            Phase::Route => "route",
            Phase::ActionLookup => "action_lookup",
            Phase::Generate => "generate",
            Phase::Execute => "execute",
            Phase::Verify => "verify",
            Phase::Knowledge(KnowledgeOp::Store) => "knowledge_store",
            Phase::Knowledge(KnowledgeOp::Query) => "knowledge_query",
            Phase::Paused(PausePoint::BeforeExecute) => "paused_before_execute",
            Phase::Paused(PausePoint::AfterVerify) => "paused_after_verify",
            Phase::End => "end",
            Phase::Error => "error",
        }
    }
}

/// 暂停后恢复所需的人工指令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Directive {
    Approve,
    /// 用修改后的脚本替换待执行脚本（仅 BeforeExecute）
    Edit { script: String },
    Reject { reason: String },
    /// 覆盖判定结论（仅 AfterVerify）
    OverrideVerification {
        success: bool,
        task_done: bool,
        summary: String,
    },
}

/// 待执行脚本的来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptSource {
    Generated,
    Edited,
    Cached { entry_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingScript {
    pub code: String,
    pub source: ScriptSource,
}

impl PendingScript {
    pub fn cached_entry(&self) -> Option<&str> {
        match &self.source {
            ScriptSource::Cached { entry_id } => Some(entry_id),
            _ => None,
        }
    }
}

/// 步骤失败的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 语法 / 名称 / 类型错误
    Transient,
    /// 定位失败、元素过期
    EnvironmentMismatch,
    /// 其它运行期错误或判定为失败
    Runtime,
    Timeout,
    /// 人工拒绝
    Rejected,
}

/// 步骤结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    StepFail(FailureKind),
    StepSuccessContinue,
    StepSuccessDone,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, StepOutcome::StepFail(_))
    }
}

/// 一次验证的结论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub outcome: StepOutcome,
    pub summary: String,
    /// 判定器或规划器是否声称任务已完成（最终是否完成还取决于已完成步骤清单）
    pub task_done_claimed: bool,
}

/// 待提交的 L2 命中/失败反馈；断点落盘成功后才写入动作缓存
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheFeedback {
    Hit(String),
    Failure(String),
}

/// 最近一次观察到的环境
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedEnvironment {
    pub fingerprint: String,
    pub source_id: String,
    /// 截断后的结构文本，供规划与生成参考
    pub structure_excerpt: String,
}

/// 编排状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub session_id: String,
    pub user_task: String,
    pub phase: Phase,
    /// 已提交的转移次数（即断点序号）
    pub seq: u64,
    pub loop_count: u32,
    pub plan: Option<Plan>,
    /// 已完成步骤清单
    pub finished_steps: Vec<String>,
    /// 最近一次非空的规划子步骤；只声明完成而不带清单的规划按它判断是否完成
    #[serde(default)]
    pub plan_checklist: Vec<String>,
    pub is_complete: bool,
    pub environment: Option<ObservedEnvironment>,
    pub strategy: Option<LocatorStrategy>,
    /// 当前策略来自 L1 缓存
    pub strategy_from_cache: bool,
    pub pending_script: Option<PendingScript>,
    pub last_execution: Option<ExecutionResult>,
    pub last_verification: Option<Verification>,
    pub micro_retry_count: u32,
    pub step_fail_count: u32,
    /// 复用的脚本失败后，直到下一个成功步骤前不再查 L2
    pub cache_failed_this_round: bool,
    /// 下一次观察必须重新感知
    pub force_fresh_perception: bool,
    /// 微重试时注入生成阶段的错误信息
    pub generation_feedback: Option<String>,
    pub reflections: Vec<String>,
    /// 知识库问答等对用户可见的输出
    pub outputs: Vec<String>,
    pub last_error: Option<String>,
    /// 进入 Error 前所在阶段，人工恢复时从这里继续
    pub error_resume_phase: Option<Phase>,
    #[serde(skip)]
    pub(crate) cache_feedback: Vec<CacheFeedback>,
}

impl TaskState {
    pub fn new(session_id: impl Into<String>, user_task: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_task: user_task.into(),
            phase: Phase::Observe,
            seq: 0,
            loop_count: 0,
            plan: None,
            finished_steps: Vec::new(),
            plan_checklist: Vec::new(),
            is_complete: false,
            environment: None,
            strategy: None,
            strategy_from_cache: false,
            pending_script: None,
            last_execution: None,
            last_verification: None,
            micro_retry_count: 0,
            step_fail_count: 0,
            cache_failed_this_round: false,
            force_fresh_perception: false,
            generation_feedback: None,
            reflections: Vec::new(),
            outputs: Vec::new(),
            last_error: None,
            error_resume_phase: None,
            cache_feedback: Vec::new(),
        }
    }

    pub fn source_id(&self) -> &str {
        self.environment.as_ref().map(|e| e.source_id.as_str()).unwrap_or("")
    }

    pub fn handle(&self) -> EnvironmentHandle {
        EnvironmentHandle::new(self.session_id.clone(), self.source_id())
    }

    pub fn current_step(&self) -> &str {
        self.plan.as_ref().map(|p| p.current_step.as_str()).unwrap_or("")
    }

    pub fn ledger_contains(&self, step: &str) -> bool {
        let key = normalize_step(step);
        !key.is_empty() && self.finished_steps.iter().any(|s| normalize_step(s) == key)
    }

    /// 记入已完成步骤（去重）
    pub fn record_finished(&mut self, step: &str) {
        let step = step.trim();
        if !step.is_empty() && !self.ledger_contains(step) {
            self.finished_steps.push(step.to_string());
        }
    }

    /// 已完成步骤清单（可再加上当前步骤）是否覆盖规划中的全部子步骤
    pub fn ledger_covers(&self, required: &[String], including: Option<&str>) -> bool {
        let extra = including.map(normalize_step);
        required.iter().all(|r| {
            let key = normalize_step(r);
            key.is_empty() || self.ledger_contains(r) || extra.as_deref() == Some(key.as_str())
        })
    }

    /// 判断完成所用的子步骤：当前规划自带的清单，否则是最近一次记下的清单
    pub fn completion_checklist(&self) -> &[String] {
        match self.plan.as_ref().map(|p| p.required_steps.as_slice()) {
            Some(required) if !required.is_empty() => required,
            _ => &self.plan_checklist,
        }
    }

    /// 任务是否可以判定为完成：至少完成过一个步骤，且覆盖全部子步骤
    pub fn completion_covered(&self, including: Option<&str>) -> bool {
        let progressed = !self.finished_steps.is_empty()
            || including.map(|s| !normalize_step(s).is_empty()).unwrap_or(false);
        progressed && self.ledger_covers(self.completion_checklist(), including)
    }

    /// 在已有会话上开始新任务；keep_progress 为 false 时清空进度
    pub fn restart_with_task(&mut self, user_task: impl Into<String>, keep_progress: bool) {
        let mut fresh = TaskState::new(self.session_id.clone(), user_task);
        fresh.seq = self.seq;
        fresh.environment = self.environment.clone();
        fresh.strategy = self.strategy.clone();
        fresh.strategy_from_cache = self.strategy_from_cache;
        if keep_progress {
            fresh.finished_steps = std::mem::take(&mut self.finished_steps);
            fresh.plan_checklist = std::mem::take(&mut self.plan_checklist);
            fresh.outputs = std::mem::take(&mut self.outputs);
        }
        *self = fresh;
    }

    pub fn push_reflection(&mut self, text: impl Into<String>) {
        const MAX_REFLECTIONS: usize = 8;
        self.reflections.push(text.into());
        if self.reflections.len() > MAX_REFLECTIONS {
            let overflow = self.reflections.len() - MAX_REFLECTIONS;
            self.reflections.drain(0..overflow);
        }
    }
}

/// 步骤比较用的归一化：去编号前缀、小写、压缩空白、去句末标点
pub fn normalize_step(step: &str) -> String {
    let s = step.trim();
    let s = s.trim_start_matches(|c: char| c.is_ascii_digit());
    let s = s.trim_start_matches(['.', ')', '、', '-', '*', ' ']);
    let s = s.trim_end_matches(['.', '。', '!', '！', ';', '；']);
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_step() {
        assert_eq!(normalize_step("1. Open  Example.com."), "open example.com");
        assert_eq!(normalize_step("2) 搜索 大海。"), "搜索 大海");
        assert_eq!(normalize_step("- click login"), "click login");
    }

    #[test]
    fn test_ledger_dedup_and_cover() {
        let mut s = TaskState::new("s", "t");
        s.record_finished("1. step1");
        s.record_finished("step1");
        assert_eq!(s.finished_steps.len(), 1);
        let plan = vec!["step1".to_string(), "step2".to_string()];
        assert!(!s.ledger_covers(&plan, None));
        assert!(s.ledger_covers(&plan, Some("2. step2")));
    }

    #[test]
    fn test_completion_falls_back_to_remembered_checklist() {
        let mut s = TaskState::new("s", "t");
        assert!(!s.completion_covered(None));

        s.plan_checklist = vec!["step1".to_string(), "step2".to_string()];
        s.plan = Some(Plan {
            text: "done".into(),
            current_step: String::new(),
            required_steps: Vec::new(),
            declares_done: true,
        });
        s.record_finished("step1");
        assert_eq!(s.completion_checklist(), s.plan_checklist.as_slice());
        assert!(!s.completion_covered(None));
        assert!(s.completion_covered(Some("step2")));
        s.record_finished("step2");
        assert!(s.completion_covered(None));
    }

    #[test]
    fn test_restart_keeps_environment() {
        let mut s = TaskState::new("s", "old");
        s.environment = Some(ObservedEnvironment {
            fingerprint: "fp".into(),
            source_id: "https://a.com".into(),
            structure_excerpt: String::new(),
        });
        s.record_finished("done thing");
        s.seq = 7;
        s.restart_with_task("new", false);
        assert_eq!(s.user_task, "new");
        assert!(s.finished_steps.is_empty());
        assert_eq!(s.source_id(), "https://a.com");
        assert_eq!(s.seq, 7);
    }

    #[test]
    fn test_phase_serde_snake_case() {
        let json = serde_json::to_string(&Phase::Paused(PausePoint::BeforeExecute)).unwrap();
        assert_eq!(json, r#"{"paused":"before_execute"}"#);
        let back: Phase = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Phase::Paused(PausePoint::BeforeExecute));
    }
}
