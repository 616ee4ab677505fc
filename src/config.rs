//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AUTOWEB__*` 覆盖（双下划线表示嵌套，如 `AUTOWEB__ACTION_CACHE__THRESHOLD=0.85`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub perception_cache: PerceptionCacheSection,
    pub action_cache: ActionCacheSection,
    pub orchestrator: OrchestratorSection,
    pub checkpoint: CheckpointSection,
    pub routing: RoutingSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 起始页；为空时从空白页开始
    pub start_url: Option<String>,
}

/// [llm] 段：后端与模型
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock；未配置 API Key 时自动退回 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// [embedding] 段
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingSection {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            base_url: None,
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

/// [perception_cache] 段：L1 感知缓存
#[derive(Debug, Clone, Deserialize)]
pub struct PerceptionCacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 条目存活时间（小时）
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    /// 参与指纹计算的结构文本最大字符数
    #[serde(default = "default_max_structure_chars")]
    pub max_structure_chars: usize,
}

impl Default for PerceptionCacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_hours: default_ttl_hours(),
            max_structure_chars: default_max_structure_chars(),
        }
    }
}

impl PerceptionCacheSection {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours as i64)
    }
}

fn default_true() -> bool {
    true
}

fn default_ttl_hours() -> u64 {
    168
}

fn default_max_structure_chars() -> usize {
    20_000
}

/// [action_cache] 段：L2 动作缓存
#[derive(Debug, Clone, Deserialize)]
pub struct ActionCacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 命中阈值（复合得分）
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default)]
    pub weights: FacetWeights,
    /// 与最高分相差不超过该值的候选视为并列，取最新创建者
    #[serde(default = "default_tie_epsilon")]
    pub tie_epsilon: f32,
    /// 与已有条目的复合得分达到该值即视为重复，不再新写
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: f32,
    #[serde(default = "default_min_script_chars")]
    pub min_script_chars: usize,
    /// 失败次数达到该值的条目被淘汰
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl Default for ActionCacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_threshold(),
            weights: FacetWeights::default(),
            tie_epsilon: default_tie_epsilon(),
            duplicate_threshold: default_duplicate_threshold(),
            min_script_chars: default_min_script_chars(),
            max_failures: default_max_failures(),
        }
    }
}

fn default_threshold() -> f32 {
    0.90
}

fn default_tie_epsilon() -> f32 {
    1e-3
}

fn default_duplicate_threshold() -> f32 {
    0.90
}

fn default_min_script_chars() -> usize {
    50
}

fn default_max_failures() -> u32 {
    3
}

/// 三个检索维度的权重：目标 / 方法提示 / 上下文
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, serde::Serialize)]
pub struct FacetWeights {
    pub goal: f32,
    pub method: f32,
    pub context: f32,
}

impl Default for FacetWeights {
    fn default() -> Self {
        Self {
            goal: 0.6,
            method: 0.2,
            context: 0.2,
        }
    }
}

impl FacetWeights {
    pub fn new(goal: f32, method: f32, context: f32) -> Self {
        Self {
            goal,
            method,
            context,
        }
    }

    /// 归一化：负值按 0 处理；总和不为正时退回默认权重
    pub fn normalized(&self) -> Self {
        let goal = self.goal.max(0.0);
        let method = self.method.max(0.0);
        let context = self.context.max(0.0);
        let total = goal + method + context;
        if !total.is_finite() || total <= 0.0 {
            return Self::default();
        }
        Self {
            goal: goal / total,
            method: method / total,
            context: context / total,
        }
    }
}

/// [orchestrator] 段：循环预算、重试、暂停点、各外部调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    /// 生成脚本出现语法类错误时回到生成阶段的次数上限
    #[serde(default = "default_max_micro_retries")]
    pub max_micro_retries: u32,
    /// 连续失败达到该值时提示规划器换一种做法
    #[serde(default = "default_force_alternative_after")]
    pub force_alternative_after: u32,
    /// 连续失败达到该值时进入 Error
    #[serde(default = "default_max_step_failures")]
    pub max_step_failures: u32,
    #[serde(default)]
    pub pause_before_execute: bool,
    #[serde(default)]
    pub pause_after_verify: bool,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_loops: default_max_loops(),
            max_micro_retries: default_max_micro_retries(),
            force_alternative_after: default_force_alternative_after(),
            max_step_failures: default_max_step_failures(),
            pause_before_execute: false,
            pause_after_verify: false,
            timeouts: TimeoutsSection::default(),
        }
    }
}

fn default_max_loops() -> u32 {
    10
}

fn default_max_micro_retries() -> u32 {
    3
}

fn default_force_alternative_after() -> u32 {
    2
}

fn default_max_step_failures() -> u32 {
    4
}

/// [orchestrator.timeouts] 段（秒）
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_observe_secs")]
    pub observe: u64,
    #[serde(default = "default_llm_secs")]
    pub perception: u64,
    #[serde(default = "default_llm_secs")]
    pub planning: u64,
    #[serde(default = "default_llm_secs")]
    pub generation: u64,
    #[serde(default = "default_execute_secs")]
    pub execution: u64,
    #[serde(default = "default_llm_secs")]
    pub verification: u64,
    #[serde(default = "default_observe_secs")]
    pub embedding: u64,
    #[serde(default = "default_llm_secs")]
    pub knowledge: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            observe: default_observe_secs(),
            perception: default_llm_secs(),
            planning: default_llm_secs(),
            generation: default_llm_secs(),
            execution: default_execute_secs(),
            verification: default_llm_secs(),
            embedding: default_observe_secs(),
            knowledge: default_llm_secs(),
        }
    }
}

fn default_observe_secs() -> u64 {
    15
}

fn default_llm_secs() -> u64 {
    60
}

fn default_execute_secs() -> u64 {
    120
}

/// 外部调用类别，用于查表取超时
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Observe,
    Perception,
    Planning,
    Generation,
    Execution,
    Verification,
    Embedding,
    Knowledge,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Observe => "observe",
            CallKind::Perception => "perception",
            CallKind::Planning => "planning",
            CallKind::Generation => "generation",
            CallKind::Execution => "execution",
            CallKind::Verification => "verification",
            CallKind::Embedding => "embedding",
            CallKind::Knowledge => "knowledge",
        }
    }
}

impl TimeoutsSection {
    pub fn for_call(&self, kind: CallKind) -> Duration {
        let secs = match kind {
            CallKind::Observe => self.observe,
            CallKind::Perception => self.perception,
            CallKind::Planning => self.planning,
            CallKind::Generation => self.generation,
            CallKind::Execution => self.execution,
            CallKind::Verification => self.verification,
            CallKind::Embedding => self.embedding,
            CallKind::Knowledge => self.knowledge,
        };
        Duration::from_secs(secs.max(1))
    }
}

/// [checkpoint] 段：断点后端（memory / file / sqlite）
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSection {
    #[serde(default = "default_checkpoint_backend")]
    pub backend: String,
    /// file 后端为目录，sqlite 后端为数据库文件
    pub path: Option<PathBuf>,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            backend: default_checkpoint_backend(),
            path: None,
        }
    }
}

fn default_checkpoint_backend() -> String {
    "memory".to_string()
}

/// [routing] 段：静态关键词表
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingSection {
    /// 计划步骤包含这些词时走知识库写入
    #[serde(default = "default_store_keywords")]
    pub store_keywords: Vec<String>,
    /// 计划步骤包含这些词时走知识库问答
    #[serde(default = "default_query_keywords")]
    pub query_keywords: Vec<String>,
    /// 用户任务包含这些词时，完成前必须做过一次知识库写入
    #[serde(default = "default_goal_keywords")]
    pub goal_keywords: Vec<String>,
    /// 已完成步骤包含这些词即视为已写入知识库
    #[serde(default = "default_done_keywords")]
    pub done_keywords: Vec<String>,
    /// 新任务包含这些词时视为旧任务的延续
    #[serde(default = "default_continue_keywords")]
    pub continue_keywords: Vec<String>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            store_keywords: default_store_keywords(),
            query_keywords: default_query_keywords(),
            goal_keywords: default_goal_keywords(),
            done_keywords: default_done_keywords(),
            continue_keywords: default_continue_keywords(),
        }
    }
}

fn default_store_keywords() -> Vec<String> {
    vec![
        "存入知识库".into(),
        "写入知识库".into(),
        "存入向量".into(),
        "save_to_kb".into(),
        "store in knowledge base".into(),
    ]
}

fn default_query_keywords() -> Vec<String> {
    vec![
        "查询知识库".into(),
        "知识库问答".into(),
        "ask_knowledge_base".into(),
        "query the knowledge base".into(),
    ]
}

fn default_goal_keywords() -> Vec<String> {
    vec![
        "知识库".into(),
        "向量数据库".into(),
        "knowledge base".into(),
    ]
}

fn default_done_keywords() -> Vec<String> {
    vec!["[knowledge:store]".into(), "存入知识库完成".into()]
}

fn default_continue_keywords() -> Vec<String> {
    vec![
        "继续".into(),
        "接着".into(),
        "下一页".into(),
        "continue".into(),
        "next page".into(),
    ]
}

/// 从 config 目录加载配置，环境变量 AUTOWEB__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AUTOWEB__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AUTOWEB")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
