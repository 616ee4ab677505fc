//! 集成测试用的脚本化外部能力

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use autoweb::cache::{EnvironmentSnapshot, InMemoryVectorStore, PerceptionCache, VectorStore};
use autoweb::capability::{
    Capabilities, EnvironmentHandle, ExecutionCapability, ExecutionResult, GenerationCapability,
    GenerationRequest, InMemoryKnowledgeStore, LocatorStrategy, LocatorTarget, PerceptionCapability, Plan,
    PlanningCapability, PlanningContext, RawObservation, StepJudge, Verdict,
};
use autoweb::config::AppConfig;
use autoweb::core::state::normalize_step;
use autoweb::core::{AgentError, CheckpointError, CheckpointRecord, CheckpointStore, InMemoryCheckpointStore};
use autoweb::llm::MockEmbedder;
use autoweb::{EngineBuilder, Orchestrator};

pub const PAGE_URL: &str = "https://www.baidu.com/";
pub const PAGE_STRUCTURE: &str = "body\n  form#form\n    input#kw [name=wd]\n    input#su [type=submit] \"百度一下\"";

/// 按固定子步骤清单规划：当前步骤是第一个未完成的步骤，全部完成后声明完成
pub struct StepPlanner {
    steps: Vec<String>,
    pub calls: AtomicUsize,
    fail_remaining: AtomicUsize,
    pub contexts: Mutex<Vec<PlanningContext>>,
}

impl StepPlanner {
    pub fn new(steps: &[&str]) -> Self {
        Self {
            steps: steps.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
            fail_remaining: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// 前 n 次调用返回错误
    pub fn failing_first(self, n: usize) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlanningCapability for StepPlanner {
    async fn plan(&self, ctx: &PlanningContext) -> Result<Plan, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(ctx.clone());
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AgentError::capability("planning", "model unavailable"));
        }
        let finished: Vec<String> = ctx.finished_steps.iter().map(|s| normalize_step(s)).collect();
        let next = self
            .steps
            .iter()
            .find(|s| !finished.contains(&normalize_step(s)))
            .cloned();
        Ok(Plan {
            text: format!("plan: {:?}", self.steps),
            declares_done: next.is_none(),
            current_step: next.unwrap_or_default(),
            required_steps: self.steps.clone(),
        })
    }
}

/// 在指定的调用次序上提前声明完成，且不附带子步骤清单；其余调用交给 StepPlanner
pub struct EagerPlanner {
    inner: StepPlanner,
    done_on: Vec<usize>,
    calls: AtomicUsize,
}

impl EagerPlanner {
    pub fn new(steps: &[&str], done_on: &[usize]) -> Self {
        Self {
            inner: StepPlanner::new(steps),
            done_on: done_on.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }

    /// 每次都声明完成
    pub fn always_done() -> Self {
        Self::new(&[], &[])
    }
}

#[async_trait]
impl PlanningCapability for EagerPlanner {
    async fn plan(&self, ctx: &PlanningContext) -> Result<Plan, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.inner.steps.is_empty() || self.done_on.contains(&call) {
            return Ok(Plan {
                text: "【任务已完成】".to_string(),
                current_step: String::new(),
                required_steps: Vec::new(),
                declares_done: true,
            });
        }
        self.inner.plan(ctx).await
    }
}

/// 根据任务最后一个词生成输入并提交搜索的脚本
pub fn search_script(request: &GenerationRequest) -> String {
    let keyword = request.user_task.split_whitespace().last().unwrap_or("");
    format!(
        "await page.type('#kw', \"{keyword}\");\nawait page.click('#su');\nreturn 'submitted search';"
    )
}

pub struct TemplateGenerator {
    template: fn(&GenerationRequest) -> String,
    pub calls: AtomicUsize,
    pub feedback: Mutex<Vec<Option<String>>>,
}

impl TemplateGenerator {
    pub fn new(template: fn(&GenerationRequest) -> String) -> Self {
        Self {
            template,
            calls: AtomicUsize::new(0),
            feedback: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationCapability for TemplateGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.feedback.lock().unwrap().push(request.feedback.clone());
        Ok((self.template)(request))
    }
}

pub fn search_strategy() -> LocatorStrategy {
    LocatorStrategy::default()
        .with_target("query", LocatorTarget::new("#kw", "search box"))
        .with_target("submit", LocatorTarget::new("#su", "search button"))
}

pub struct CountingPerception {
    pub calls: AtomicUsize,
}

impl CountingPerception {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PerceptionCapability for CountingPerception {
    async fn analyze(&self, _snapshot: &EnvironmentSnapshot, _task: &str) -> Result<LocatorStrategy, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(search_strategy())
    }
}

/// 单页面环境：记录执行过的脚本，可预置执行结果与延迟
pub struct MockEnvironment {
    source: Mutex<String>,
    pub executed: Mutex<Vec<String>>,
    results: Mutex<VecDeque<ExecutionResult>>,
    delay: Mutex<Option<Duration>>,
}

impl MockEnvironment {
    pub fn new() -> Self {
        Self {
            source: Mutex::new(PAGE_URL.to_string()),
            executed: Mutex::new(Vec::new()),
            results: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
        }
    }

    pub fn push_result(&self, result: ExecutionResult) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionCapability for MockEnvironment {
    async fn capture(&self, _handle: &EnvironmentHandle) -> Result<RawObservation, AgentError> {
        Ok(RawObservation {
            structure: PAGE_STRUCTURE.to_string(),
            source_id: self.source.lock().unwrap().clone(),
        })
    }

    async fn execute(&self, script: &str, _handle: &EnvironmentHandle) -> Result<ExecutionResult, AgentError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.executed.lock().unwrap().push(script.to_string());
        let queued = self.results.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| ExecutionResult::ok("ok")))
    }
}

/// 按顺序返回预置结论，用完后返回成功且未完成
pub struct QueueJudge {
    verdicts: Mutex<VecDeque<Verdict>>,
}

impl QueueJudge {
    pub fn new(verdicts: Vec<Verdict>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
        }
    }
}

#[async_trait]
impl StepJudge for QueueJudge {
    async fn judge(&self, _plan: &Plan, _result: &ExecutionResult, _source_id: &str) -> Result<Verdict, AgentError> {
        Ok(self.verdicts.lock().unwrap().pop_front().unwrap_or(Verdict {
            success: true,
            task_done: false,
            summary: "step looks fine".into(),
        }))
    }
}

/// 可以让下一次 save 失败的断点存储
#[derive(Default)]
pub struct FlakyCheckpoints {
    inner: InMemoryCheckpointStore,
    fail_next: AtomicBool,
}

impl FlakyCheckpoints {
    pub fn fail_next_save(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl CheckpointStore for FlakyCheckpoints {
    fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable("disk full".into()));
        }
        self.inner.save(record)
    }

    fn load(&self, session_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        self.inner.load(session_id)
    }

    fn delete(&self, session_id: &str) -> Result<(), CheckpointError> {
        self.inner.delete(session_id)
    }

    fn list(&self) -> Result<Vec<String>, CheckpointError> {
        self.inner.list()
    }
}

/// 一组共享的 mock 能力与存储；可以用同一组存储构造多个编排器（模拟进程重启）
pub struct Harness {
    pub config: AppConfig,
    pub planner: Arc<StepPlanner>,
    pub generator: Arc<TemplateGenerator>,
    pub perception: Arc<CountingPerception>,
    pub environment: Arc<MockEnvironment>,
    pub knowledge: Arc<InMemoryKnowledgeStore>,
    pub judge: Option<Arc<dyn StepJudge>>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub perception_cache: Arc<PerceptionCache>,
}

impl Harness {
    pub fn new(steps: &[&str]) -> Self {
        autoweb::observability::try_init();
        let config = AppConfig::default();
        let perception_cache = Arc::new(PerceptionCache::from_config(&config.perception_cache));
        Self {
            config,
            planner: Arc::new(StepPlanner::new(steps)),
            generator: Arc::new(TemplateGenerator::new(search_script)),
            perception: Arc::new(CountingPerception::new()),
            environment: Arc::new(MockEnvironment::new()),
            knowledge: Arc::new(InMemoryKnowledgeStore::default()),
            judge: None,
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            vectors: Arc::new(InMemoryVectorStore::new(100)),
            perception_cache,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            perception: self.perception.clone(),
            planner: self.planner.clone(),
            generator: self.generator.clone(),
            environment: self.environment.clone(),
            judge: self.judge.clone(),
            knowledge: self.knowledge.clone(),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(self.capabilities())
    }

    /// 用替换过部分能力的 Capabilities 构造编排器，存储仍然共享
    pub fn orchestrator_with(&self, caps: Capabilities) -> Orchestrator {
        EngineBuilder::new(self.config.clone())
            .with_capabilities(caps)
            .with_checkpoints(self.checkpoints.clone())
            .with_vector_store(self.vectors.clone())
            .with_perception_cache(self.perception_cache.clone())
            .with_embedder(Arc::new(MockEmbedder::default()))
            .build()
            .expect("orchestrator builds")
    }
}
