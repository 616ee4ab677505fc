//! 外部能力接口：感知、规划、代码生成、执行环境、步骤判定、知识库、人工审批
//!
//! 编排状态机只通过这些 trait 与外界交互。当前页面等环境上下文通过显式的 [`EnvironmentHandle`] 传递，不依赖全局状态。

pub mod dry_run;
pub mod knowledge;
pub mod llm_backed;

#[cfg(feature = "browser")]
pub mod browser;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::EnvironmentSnapshot;
use crate::core::state::{Directive, PausePoint, Verification};
use crate::core::AgentError;

#[cfg(feature = "browser")]
pub use browser::ChromeEnvironment;
pub use dry_run::DryRunEnvironment;
pub use knowledge::InMemoryKnowledgeStore;
pub use llm_backed::{LlmGenerator, LlmJudge, LlmPerception, LlmPlanner};

/// 单个目标的定位描述
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorTarget {
    pub locator: String,
    #[serde(default)]
    pub reason: String,
}

impl LocatorTarget {
    pub fn new(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            reason: reason.into(),
        }
    }
}

/// 定位策略：语义目标名 → 定位描述，外加整体说明
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorStrategy {
    #[serde(default)]
    pub targets: BTreeMap<String, LocatorTarget>,
    #[serde(default)]
    pub rationale: String,
}

impl LocatorStrategy {
    pub fn with_target(mut self, name: impl Into<String>, target: LocatorTarget) -> Self {
        self.targets.insert(name.into(), target);
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// 作为动作缓存“方法提示”维度的文本（目标名有序，保证稳定）
    pub fn method_hints(&self) -> String {
        self.targets
            .iter()
            .map(|(name, t)| format!("{name}: {}", t.locator))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 环境句柄：会话与当前来源标识
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub session_id: String,
    pub source_id: String,
}

impl EnvironmentHandle {
    pub fn new(session_id: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            source_id: source_id.into(),
        }
    }
}

/// 环境的原始观察（指纹由编排器计算）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObservation {
    pub structure: String,
    pub source_id: String,
}

/// 规划结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// 规划器原始输出
    pub text: String,
    /// 本轮要执行的步骤
    pub current_step: String,
    /// 整个任务的子步骤清单
    pub required_steps: Vec<String>,
    /// 规划器声明任务已完成
    pub declares_done: bool,
}

/// 规划输入
#[derive(Debug, Clone, Default)]
pub struct PlanningContext {
    pub user_task: String,
    pub source_id: String,
    pub structure_excerpt: String,
    pub strategy: Option<LocatorStrategy>,
    pub finished_steps: Vec<String>,
    pub reflections: Vec<String>,
    pub last_summary: Option<String>,
    /// 连续失败后要求换一种做法
    pub force_alternative: bool,
}

/// 代码生成输入
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub user_task: String,
    pub step: String,
    pub source_id: String,
    pub strategy: Option<LocatorStrategy>,
    /// 微重试时上一次的错误信息
    pub feedback: Option<String>,
}

/// 脚本执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    /// 执行后的来源标识（页面可能已跳转）
    pub source_id: Option<String>,
}

impl ExecutionResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }
}

/// 判定器给出的结论
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub success: bool,
    pub task_done: bool,
    pub summary: String,
}

/// 暂停时交给审批方的信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingApproval {
    pub session_id: String,
    pub point: PausePoint,
    pub step: String,
    pub script: Option<String>,
    pub verification: Option<Verification>,
}

#[async_trait]
pub trait PerceptionCapability: Send + Sync {
    async fn analyze(&self, snapshot: &EnvironmentSnapshot, task: &str) -> Result<LocatorStrategy, AgentError>;
}

#[async_trait]
pub trait PlanningCapability: Send + Sync {
    async fn plan(&self, ctx: &PlanningContext) -> Result<Plan, AgentError>;
}

#[async_trait]
pub trait GenerationCapability: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, AgentError>;
}

/// 执行环境：观察与执行都是一次有副作用的外部调用
#[async_trait]
pub trait ExecutionCapability: Send + Sync {
    async fn capture(&self, handle: &EnvironmentHandle) -> Result<RawObservation, AgentError>;

    async fn execute(&self, script: &str, handle: &EnvironmentHandle) -> Result<ExecutionResult, AgentError>;
}

#[async_trait]
pub trait StepJudge: Send + Sync {
    async fn judge(&self, plan: &Plan, result: &ExecutionResult, source_id: &str) -> Result<Verdict, AgentError>;
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// 写入一段数据，返回写入条数
    async fn store(&self, content: &str, source: &str) -> Result<usize, AgentError>;

    async fn query(&self, question: &str) -> Result<String, AgentError>;
}

#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn request_approval(&self, pending: &PendingApproval) -> Directive;
}

/// 总是批准
#[derive(Debug, Default, Clone)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalChannel for AutoApprove {
    async fn request_approval(&self, _pending: &PendingApproval) -> Directive {
        Directive::Approve
    }
}

/// 编排器依赖的全部外部能力
#[derive(Clone)]
pub struct Capabilities {
    pub perception: Arc<dyn PerceptionCapability>,
    pub planner: Arc<dyn PlanningCapability>,
    pub generator: Arc<dyn GenerationCapability>,
    pub environment: Arc<dyn ExecutionCapability>,
    pub judge: Option<Arc<dyn StepJudge>>,
    pub knowledge: Arc<dyn KnowledgeStore>,
}

impl Capabilities {
    /// 用同一个 LLM 客户端构造感知、规划、生成、判定能力
    pub fn from_llm(
        llm: Arc<dyn crate::llm::LlmClient>,
        environment: Arc<dyn ExecutionCapability>,
        knowledge: Arc<dyn KnowledgeStore>,
    ) -> Self {
        Self {
            perception: Arc::new(LlmPerception::new(llm.clone())),
            planner: Arc::new(LlmPlanner::new(llm.clone())),
            generator: Arc::new(LlmGenerator::new(llm.clone())),
            environment,
            judge: Some(Arc::new(LlmJudge::new(llm))),
            knowledge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_hints_stable_order() {
        let s = LocatorStrategy::default()
            .with_target("submit", LocatorTarget::new("button[type=submit]", ""))
            .with_target("query", LocatorTarget::new("input[name=q]", ""));
        assert_eq!(s.method_hints(), "query: input[name=q]\nsubmit: button[type=submit]");
    }

    #[test]
    fn test_strategy_serde_roundtrip_keeps_reason() {
        let s = LocatorStrategy::default()
            .with_target("query", LocatorTarget::new("#q", "only text box"))
            .with_rationale("search page");
        let json = serde_json::to_string(&s).unwrap();
        let back: LocatorStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
