//! 编排状态机：Observe → Plan → Route → {ActionLookup → Generate? → Execute → Verify} | Knowledge → 循环 | End | Error
//!
//! - 每次转移在 TaskState 的副本上进行，成功后写入断点再提交；取消的转移不写断点。
//! - 两个可选暂停点（执行前、验证后）等待人工指令，暂停状态本身也写入断点。
//! - 所有外部调用都带超时；执行超时按 STEP_FAIL 处理，其它超时走恢复引擎。

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::{
    diff, is_blank_source, normalize_source, substitute_with_report, ActionCache, EnvironmentSnapshot,
    Fingerprinter, PerceptionCache, StoreOutcome,
};
use crate::capability::{
    ApprovalChannel, Capabilities, ExecutionResult, GenerationRequest, PendingApproval, PlanningContext,
};
use crate::config::{AppConfig, CallKind, OrchestratorSection};
use crate::core::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::core::classifier::OutcomeClassifier;
use crate::core::events::EngineEvent;
use crate::core::router::{RouteTag, Router, KNOWLEDGE_STORE_MARK};
use crate::core::state::{
    CacheFeedback, Directive, FailureKind, KnowledgeOp, ObservedEnvironment, PausePoint, Phase, PendingScript, ScriptSource,
    StepOutcome, TaskState, Verification,
};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};

/// 规划与生成看到的结构文本上限
const STRUCTURE_EXCERPT_CHARS: usize = 4000;

/// 没有定位策略时方法维度使用的占位文本，避免空文本无法嵌入
const NO_STRATEGY_HINT: &str = "(no locator strategy)";

/// run_until_pause / resume 的停止原因
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Paused(PausePoint),
    Completed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub state: TaskState,
}

impl RunReport {
    fn from_state(state: TaskState) -> Self {
        let status = match state.phase {
            Phase::Paused(point) => RunStatus::Paused(point),
            Phase::Error => RunStatus::Failed(state.last_error.clone().unwrap_or_default()),
            _ => RunStatus::Completed,
        };
        Self { status, state }
    }
}

pub struct Orchestrator {
    caps: Capabilities,
    perception_cache: Arc<PerceptionCache>,
    action_cache: Arc<ActionCache>,
    checkpoints: Arc<dyn CheckpointStore>,
    fingerprinter: Fingerprinter,
    settings: OrchestratorSection,
    router: Router,
    classifier: OutcomeClassifier,
    recovery: RecoveryEngine,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl Orchestrator {
    pub fn new(
        caps: Capabilities,
        perception_cache: Arc<PerceptionCache>,
        action_cache: Arc<ActionCache>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            caps,
            perception_cache,
            action_cache,
            checkpoints,
            fingerprinter: Fingerprinter::new(config.perception_cache.max_structure_chars),
            settings: config.orchestrator.clone(),
            router: Router::new(config.routing.clone()),
            classifier: OutcomeClassifier::new(),
            recovery: RecoveryEngine::new(&config.orchestrator),
            events: None,
        }
    }

    /// 订阅编排事件
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn settings(&self) -> &OrchestratorSection {
        &self.settings
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// 读取会话的最新断点
    pub fn load(&self, session_id: &str) -> Result<TaskState, AgentError> {
        self.checkpoints
            .load(session_id)?
            .map(|r| r.state)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))
    }

    /// 在会话上开始任务。已有断点时按任务延续规则决定是否保留进度，环境信息总是保留。
    pub async fn start(&self, session_id: &str, user_task: &str) -> Result<TaskState, AgentError> {
        let mut state = match self.checkpoints.load(session_id)? {
            Some(record) => {
                let mut state = record.state;
                let keep = self.router.is_continuation(user_task, state.source_id());
                tracing::info!(session_id, keep_progress = keep, "new task on existing session");
                state.restart_with_task(user_task, keep);
                state
            }
            None => TaskState::new(session_id, user_task),
        };
        self.commit(&mut state)?;
        Ok(state)
    }

    /// 执行一次状态转移并写入断点。暂停或终止状态下不做任何事。
    pub async fn step(&self, state: &TaskState, cancel: &CancellationToken) -> Result<TaskState, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if state.phase.is_terminal() || matches!(state.phase, Phase::Paused(_)) {
            return Ok(state.clone());
        }
        let mut next = state.clone();
        self.transition(&mut next, cancel).await?;
        self.commit(&mut next)?;
        Ok(next)
    }

    /// 从断点继续，直到暂停、完成或出错
    pub async fn run_until_pause(&self, session_id: &str, cancel: &CancellationToken) -> Result<RunReport, AgentError> {
        let mut state = self.load(session_id)?;
        while !state.phase.is_terminal() && !matches!(state.phase, Phase::Paused(_)) {
            state = self.step(&state, cancel).await?;
        }
        Ok(RunReport::from_state(state))
    }

    /// 对暂停（或 Error）中的会话施加人工指令，然后继续运行
    pub async fn resume(
        &self,
        session_id: &str,
        directive: Directive,
        cancel: &CancellationToken,
    ) -> Result<RunReport, AgentError> {
        let state = self.load(session_id)?;
        let mut next = state.clone();
        self.apply_directive(&mut next, directive, cancel).await?;
        self.commit(&mut next)?;
        self.run_until_pause(session_id, cancel).await
    }

    /// 完整运行一个任务：暂停时向审批方请求指令
    pub async fn run(
        &self,
        session_id: &str,
        user_task: &str,
        approval: &dyn ApprovalChannel,
        cancel: &CancellationToken,
    ) -> Result<RunReport, AgentError> {
        self.start(session_id, user_task).await?;
        let mut report = self.run_until_pause(session_id, cancel).await?;
        while let RunStatus::Paused(point) = report.status {
            let pending = PendingApproval {
                session_id: session_id.to_string(),
                point,
                step: report.state.current_step().to_string(),
                script: report.state.pending_script.as_ref().map(|p| p.code.clone()),
                verification: report.state.last_verification.clone(),
            };
            let directive = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                d = approval.request_approval(&pending) => d,
            };
            report = self.resume(session_id, directive, cancel).await?;
        }
        Ok(report)
    }

    /// 写入断点；只有落盘成功后才把本次转移积累的 L2 反馈写入动作缓存
    fn commit(&self, state: &mut TaskState) -> Result<(), AgentError> {
        state.seq += 1;
        self.checkpoints.save(&CheckpointRecord::new(state))?;
        tracing::debug!(session_id = %state.session_id, phase = state.phase.as_str(), seq = state.seq, "checkpoint saved");
        for feedback in state.cache_feedback.drain(..) {
            match feedback {
                CacheFeedback::Hit(id) => self.action_cache.record_hit(&id),
                CacheFeedback::Failure(id) => self.action_cache.record_failure(&id),
            }
        }
        self.emit(EngineEvent::PhaseEntered {
            session_id: state.session_id.clone(),
            phase: state.phase.as_str().to_string(),
            seq: state.seq,
        });
        if let Phase::Paused(point) = state.phase {
            self.emit(EngineEvent::Paused {
                session_id: state.session_id.clone(),
                point,
            });
        }
        Ok(())
    }

    /// 带超时与取消的外部调用，输出 JSON 审计日志
    async fn call<T, F>(&self, kind: CallKind, cancel: &CancellationToken, fut: F) -> Result<T, AgentError>
    where
        F: Future<Output = Result<T, AgentError>>,
    {
        let start = Instant::now();
        let limit = self.settings.timeouts.for_call(kind);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            r = tokio::time::timeout(limit, fut) => match r {
                Ok(r) => r,
                Err(_) => Err(AgentError::Timeout(kind.as_str().to_string())),
            },
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(AgentError::Timeout(_)) => "timeout",
            Err(AgentError::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "capability_audit",
            "capability": kind.as_str(),
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": duration_ms,
        });
        tracing::info!(audit = %audit.to_string(), "capability");
        self.emit(EngineEvent::CapabilityCall {
            capability: kind.as_str().to_string(),
            ok: result.is_ok(),
            duration_ms,
        });
        result
    }

    async fn transition(&self, s: &mut TaskState, cancel: &CancellationToken) -> Result<(), AgentError> {
        tracing::debug!(session_id = %s.session_id, phase = s.phase.as_str(), "transition");
        match s.phase {
            Phase::Observe => self.observe(s, cancel).await,
            Phase::Plan => self.plan(s, cancel).await,
            Phase::Route => {
                self.route(s);
                Ok(())
            }
            Phase::ActionLookup => self.action_lookup(s, cancel).await,
            Phase::Generate => self.generate(s, cancel).await,
            Phase::Execute => self.execute(s, cancel).await,
            Phase::Verify => self.verify(s, cancel).await,
            Phase::Knowledge(op) => self.knowledge(s, op, cancel).await,
            Phase::Paused(_) | Phase::End | Phase::Error => Ok(()),
        }
    }

    async fn observe(&self, s: &mut TaskState, cancel: &CancellationToken) -> Result<(), AgentError> {
        let handle = s.handle();
        let env = self.caps.environment.clone();
        let raw = match self.call(CallKind::Observe, cancel, env.capture(&handle)).await {
            Ok(raw) => raw,
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => return self.on_failure(s, e, Phase::Observe),
        };

        let snapshot = EnvironmentSnapshot::capture(raw.structure, raw.source_id, &self.fingerprinter);
        let unchanged = s.strategy.is_some()
            && !s.force_fresh_perception
            && s
                .environment
                .as_ref()
                .map(|e| e.fingerprint == snapshot.fingerprint && e.source_id == snapshot.source_id)
                .unwrap_or(false);
        s.environment = Some(ObservedEnvironment {
            fingerprint: snapshot.fingerprint.clone(),
            source_id: snapshot.source_id.clone(),
            structure_excerpt: snapshot.structure.chars().take(STRUCTURE_EXCERPT_CHARS).collect(),
        });

        if snapshot.is_blank() {
            s.strategy = None;
            s.strategy_from_cache = false;
        } else if unchanged {
            tracing::debug!("environment unchanged, reusing locator strategy");
        } else {
            self.perceive(s, &snapshot, cancel).await?;
        }
        s.force_fresh_perception = false;
        s.phase = Phase::Plan;
        Ok(())
    }

    /// L1 查找，未命中时调用感知能力并写回。感知失败降级为无策略。
    async fn perceive(
        &self,
        s: &mut TaskState,
        snapshot: &EnvironmentSnapshot,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let cached = if s.force_fresh_perception {
            None
        } else {
            self.perception_cache.lookup(&snapshot.fingerprint, &snapshot.source_id)
        };
        if let Some(strategy) = cached {
            self.emit(EngineEvent::PerceptionCacheHit {
                fingerprint: snapshot.fingerprint.clone(),
            });
            s.strategy = Some(strategy);
            s.strategy_from_cache = true;
            return Ok(());
        }

        self.emit(EngineEvent::PerceptionCacheMiss {
            fingerprint: snapshot.fingerprint.clone(),
        });
        let perception = self.caps.perception.clone();
        match self
            .call(CallKind::Perception, cancel, perception.analyze(snapshot, &s.user_task))
            .await
        {
            Ok(strategy) => {
                if !strategy.is_empty() {
                    self.perception_cache
                        .store(&snapshot.fingerprint, &snapshot.source_id, &strategy, None);
                }
                s.strategy = Some(strategy);
            }
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "perception degraded, planning without locator strategy");
                s.push_reflection(format!("感知失败: {e}"));
                s.strategy = None;
            }
        }
        s.strategy_from_cache = false;
        Ok(())
    }

    async fn plan(&self, s: &mut TaskState, cancel: &CancellationToken) -> Result<(), AgentError> {
        if s.loop_count >= self.settings.max_loops {
            let reason = format!("loop budget of {} exhausted", self.settings.max_loops);
            self.enter_error(s, reason, Phase::Plan);
            return Ok(());
        }
        s.loop_count += 1;

        let ctx = PlanningContext {
            user_task: s.user_task.clone(),
            source_id: s.source_id().to_string(),
            structure_excerpt: s
                .environment
                .as_ref()
                .map(|e| e.structure_excerpt.clone())
                .unwrap_or_default(),
            strategy: s.strategy.clone(),
            finished_steps: s.finished_steps.clone(),
            reflections: s.reflections.clone(),
            last_summary: s.last_verification.as_ref().map(|v| v.summary.clone()),
            force_alternative: s.step_fail_count >= self.settings.force_alternative_after,
        };
        if ctx.force_alternative {
            tracing::info!(failures = s.step_fail_count, "asking planner for an alternative approach");
        }
        let planner = self.caps.planner.clone();
        match self.call(CallKind::Planning, cancel, planner.plan(&ctx)).await {
            Ok(plan) => {
                tracing::info!(step = %plan.current_step, done = plan.declares_done, "plan ready");
                if !plan.required_steps.is_empty() {
                    s.plan_checklist = plan.required_steps.clone();
                }
                s.plan = Some(plan);
                s.pending_script = None;
                s.micro_retry_count = 0;
                s.generation_feedback = None;
                s.phase = Phase::Route;
                Ok(())
            }
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => self.on_failure(s, e, Phase::Plan),
        }
    }

    fn route(&self, s: &mut TaskState) {
        let Some(plan) = s.plan.clone() else {
            s.phase = Phase::Plan;
            return;
        };
        if plan.declares_done {
            if self.router.needs_knowledge_store(&s.user_task, &s.finished_steps) {
                tracing::info!("completion declared, storing results to knowledge base first");
                s.phase = Phase::Knowledge(KnowledgeOp::Store);
            } else if s.completion_covered(None) {
                tracing::info!(session_id = %s.session_id, "task complete");
                s.is_complete = true;
                s.phase = Phase::End;
            } else {
                let missing: Vec<String> = s
                    .completion_checklist()
                    .iter()
                    .filter(|r| !s.ledger_contains(r))
                    .cloned()
                    .collect();
                let reflection = if missing.is_empty() {
                    "规划声称已完成，但还没有完成任何步骤".to_string()
                } else {
                    format!("规划声称已完成，但以下步骤尚未完成: {}", missing.join("; "))
                };
                tracing::info!(missing = missing.len(), "completion declared too early, replanning");
                s.push_reflection(reflection);
                s.phase = Phase::Plan;
            }
            return;
        }
        let tag = self.router.classify(&plan.current_step);
        s.phase = match tag {
            RouteTag::Action => Phase::ActionLookup,
            other => other
                .knowledge_op()
                .map(Phase::Knowledge)
                .unwrap_or(Phase::ActionLookup),
        };
    }

    /// (目标, 方法, 上下文) 三个检索维度的文本
    fn facets(&self, s: &TaskState) -> (String, String, String) {
        let goal = s.current_step().to_string();
        let method = s
            .strategy
            .as_ref()
            .map(|st| st.method_hints())
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| NO_STRATEGY_HINT.to_string());
        let context = format!("{}\n{}", s.user_task, normalize_source(s.source_id()));
        (goal, method, context)
    }

    fn before_execute(&self) -> Phase {
        if self.settings.pause_before_execute {
            Phase::Paused(PausePoint::BeforeExecute)
        } else {
            Phase::Execute
        }
    }

    async fn action_lookup(&self, s: &mut TaskState, cancel: &CancellationToken) -> Result<(), AgentError> {
        if !self.action_cache.is_enabled() || s.cache_failed_this_round || is_blank_source(s.source_id()) {
            tracing::debug!(
                failed_this_round = s.cache_failed_this_round,
                "skipping action cache lookup"
            );
            s.phase = Phase::Generate;
            return Ok(());
        }

        let (goal, method, context) = self.facets(s);
        let cache = self.action_cache.clone();
        let lookup = async { Ok::<_, AgentError>(cache.lookup(&goal, &method, &context).await) };
        let hit = match self.call(CallKind::Embedding, cancel, lookup).await {
            Ok(hit) => hit,
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "action cache lookup degraded to miss");
                None
            }
        };

        let Some(hit) = hit else {
            self.emit(EngineEvent::ActionCacheMiss);
            s.phase = Phase::Generate;
            return Ok(());
        };

        let diffs = diff(&hit.entry.original_task, &s.user_task);
        let (code, report) = substitute_with_report(&hit.entry.script, &diffs);
        tracing::info!(
            entry = %hit.entry.id,
            score = hit.score,
            diffs = diffs.len(),
            replacements = report.total_replacements(),
            "reusing cached script"
        );
        self.emit(EngineEvent::ActionCacheHit {
            entry_id: hit.entry.id.clone(),
            score: hit.score,
        });
        self.emit(EngineEvent::ParametersSubstituted {
            replacements: report.total_replacements(),
            skipped: report.skipped.len(),
        });
        s.pending_script = Some(PendingScript {
            code,
            source: ScriptSource::Cached {
                entry_id: hit.entry.id.clone(),
            },
        });
        s.phase = self.before_execute();
        Ok(())
    }

    async fn generate(&self, s: &mut TaskState, cancel: &CancellationToken) -> Result<(), AgentError> {
        let request = GenerationRequest {
            user_task: s.user_task.clone(),
            step: s.current_step().to_string(),
            source_id: s.source_id().to_string(),
            strategy: s.strategy.clone(),
            feedback: s.generation_feedback.clone(),
        };
        let generator = self.caps.generator.clone();
        match self.call(CallKind::Generation, cancel, generator.generate(&request)).await {
            Ok(code) if !code.trim().is_empty() => {
                s.pending_script = Some(PendingScript {
                    code,
                    source: ScriptSource::Generated,
                });
                s.phase = self.before_execute();
                Ok(())
            }
            Ok(_) => self.on_failure(s, AgentError::capability("generation", "empty script"), Phase::Plan),
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => self.on_failure(s, e, Phase::Plan),
        }
    }

    async fn execute(&self, s: &mut TaskState, cancel: &CancellationToken) -> Result<(), AgentError> {
        let Some(script) = s.pending_script.clone() else {
            tracing::warn!("execute without pending script, regenerating");
            s.phase = Phase::Generate;
            return Ok(());
        };
        let handle = s.handle();
        let env = self.caps.environment.clone();
        let result = match self.call(CallKind::Execution, cancel, env.execute(&script.code, &handle)).await {
            Ok(result) => result,
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => ExecutionResult::failed(e.to_string()),
        };

        let audit = serde_json::json!({
            "event": "script_audit",
            "session_id": s.session_id,
            "step": s.current_step(),
            "source": match &script.source {
                ScriptSource::Generated => "generated",
                ScriptSource::Edited => "edited",
                ScriptSource::Cached { .. } => "cached",
            },
            "ok": result.success,
            "script_chars": script.code.chars().count(),
        });
        tracing::info!(audit = %audit.to_string(), "script");

        if let (Some(source), Some(env)) = (&result.source_id, s.environment.as_mut()) {
            env.source_id = source.clone();
        }

        let transient = self
            .classifier
            .execution_failure(&result)
            .map(|(kind, msg)| (kind == FailureKind::Transient, msg));
        s.last_execution = Some(result);

        if let Some((true, msg)) = transient {
            if script.source == ScriptSource::Generated && s.micro_retry_count < self.settings.max_micro_retries {
                let action = self.recovery.handle(
                    &AgentError::TransientExecution(msg.clone()),
                    s.micro_retry_count,
                    s.step_fail_count,
                );
                if let RecoveryAction::MicroRetry(hint) = action {
                    s.micro_retry_count += 1;
                    tracing::info!(attempt = s.micro_retry_count, error = %msg, "micro-retry generation");
                    s.generation_feedback = Some(hint);
                    s.pending_script = None;
                    s.phase = Phase::Generate;
                    return Ok(());
                }
            }
        }
        s.phase = Phase::Verify;
        Ok(())
    }

    async fn verify(&self, s: &mut TaskState, cancel: &CancellationToken) -> Result<(), AgentError> {
        let result = s
            .last_execution
            .clone()
            .unwrap_or_else(|| ExecutionResult::failed("no execution result"));

        let verification = if self.classifier.execution_failure(&result).is_some() {
            self.classifier.classify(&result, None, s)
        } else {
            match (&self.caps.judge, s.plan.clone()) {
                (Some(judge), Some(plan)) => {
                    let judge = judge.clone();
                    let source = s.source_id().to_string();
                    match self
                        .call(CallKind::Verification, cancel, judge.judge(&plan, &result, &source))
                        .await
                    {
                        Ok(verdict) => self.classifier.classify(&result, Some(&verdict), s),
                        Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                        Err(e) => {
                            let kind = match e {
                                AgentError::Timeout(_) => FailureKind::Timeout,
                                _ => FailureKind::Runtime,
                            };
                            Verification {
                                outcome: StepOutcome::StepFail(kind),
                                summary: format!("verification failed: {e}"),
                                task_done_claimed: false,
                            }
                        }
                    }
                }
                _ => self.classifier.classify(&result, None, s),
            }
        };

        tracing::info!(outcome = ?verification.outcome, summary = %verification.summary, "step verified");
        self.emit(EngineEvent::StepOutcome {
            outcome: verification.outcome,
            summary: verification.summary.clone(),
        });
        s.last_verification = Some(verification);

        if self.settings.pause_after_verify {
            s.phase = Phase::Paused(PausePoint::AfterVerify);
            Ok(())
        } else {
            self.apply_outcome(s, cancel).await
        }
    }

    /// 把 last_verification 落到状态上：记账、写缓存、决定下一阶段
    async fn apply_outcome(&self, s: &mut TaskState, cancel: &CancellationToken) -> Result<(), AgentError> {
        let Some(verification) = s.last_verification.clone() else {
            s.phase = Phase::Plan;
            return Ok(());
        };
        match verification.outcome {
            StepOutcome::StepFail(kind) => {
                self.apply_failure(s, kind, &verification.summary);
                Ok(())
            }
            outcome => {
                let step = s.current_step().to_string();
                s.record_finished(&step);
                s.step_fail_count = 0;
                s.micro_retry_count = 0;
                s.generation_feedback = None;
                s.cache_failed_this_round = false;

                if let Some(script) = s.pending_script.take() {
                    self.remember_script(s, &verification, &script, cancel).await?;
                }

                if outcome == StepOutcome::StepSuccessDone {
                    if self.router.needs_knowledge_store(&s.user_task, &s.finished_steps) {
                        s.phase = Phase::Knowledge(KnowledgeOp::Store);
                    } else {
                        tracing::info!(session_id = %s.session_id, "task complete");
                        s.is_complete = true;
                        s.phase = Phase::End;
                    }
                } else {
                    s.phase = Phase::Observe;
                }
                Ok(())
            }
        }
    }

    async fn remember_script(
        &self,
        s: &mut TaskState,
        verification: &Verification,
        script: &PendingScript,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        if let Some(id) = script.cached_entry() {
            s.cache_feedback.push(CacheFeedback::Hit(id.to_string()));
            return Ok(());
        }
        let Some(verified) = self.classifier.certify(verification, script) else {
            return Ok(());
        };
        let (goal, method, context) = self.facets(s);
        let cache = self.action_cache.clone();
        let task = s.user_task.clone();
        let store = async { Ok::<_, AgentError>(cache.store(&goal, &method, &context, verified, &task).await) };
        match self.call(CallKind::Embedding, cancel, store).await {
            Ok(StoreOutcome::Failed(e)) => tracing::warn!(error = %e, "verified script not cached"),
            Ok(outcome) => tracing::debug!(?outcome, "action cache write"),
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => tracing::warn!(error = %e, "verified script not cached"),
        }
        Ok(())
    }

    fn apply_failure(&self, s: &mut TaskState, kind: FailureKind, summary: &str) {
        s.step_fail_count += 1;
        s.last_error = Some(summary.to_string());

        // 失败步骤所依据的定位策略不再可信，无论它来自缓存还是刚感知
        if s.strategy.is_some() {
            if let Some(env) = &s.environment {
                self.perception_cache.invalidate(&env.fingerprint, &env.source_id);
            }
        }
        let used_cached_strategy = s.strategy_from_cache;
        if used_cached_strategy {
            s.strategy = None;
            s.strategy_from_cache = false;
        }
        if let Some(script) = s.pending_script.take() {
            if let Some(id) = script.cached_entry() {
                s.cache_feedback.push(CacheFeedback::Failure(id.to_string()));
                s.cache_failed_this_round = true;
            }
        }
        s.push_reflection(format!("步骤「{}」失败 ({kind:?}): {summary}", s.current_step()));

        let err = match kind {
            FailureKind::Transient => AgentError::TransientExecution(summary.to_string()),
            FailureKind::EnvironmentMismatch => AgentError::EnvironmentMismatch(summary.to_string()),
            FailureKind::Timeout => AgentError::Timeout(summary.to_string()),
            FailureKind::Runtime => AgentError::capability("execution", summary),
            FailureKind::Rejected => AgentError::capability("operator", summary),
        };
        // 微重试只发生在执行阶段，这里不再触发
        match self.recovery.handle(&err, u32::MAX, s.step_fail_count) {
            RecoveryAction::Abort => self.enter_error(s, err.to_string(), Phase::Plan),
            RecoveryAction::Replan { invalidate_perception } if invalidate_perception || used_cached_strategy => {
                s.force_fresh_perception = true;
                s.phase = Phase::Observe;
            }
            RecoveryAction::SkipCache => {
                s.cache_failed_this_round = true;
                s.phase = Phase::Plan;
            }
            RecoveryAction::Replan { .. } | RecoveryAction::MicroRetry(_) => s.phase = Phase::Plan,
        }
    }

    async fn knowledge(&self, s: &mut TaskState, op: KnowledgeOp, cancel: &CancellationToken) -> Result<(), AgentError> {
        let kb = self.caps.knowledge.clone();
        match op {
            KnowledgeOp::Store => {
                let content = s
                    .last_execution
                    .as_ref()
                    .filter(|r| r.success && !r.output.trim().is_empty())
                    .map(|r| r.output.clone())
                    .or_else(|| s.plan.as_ref().map(|p| p.text.clone()))
                    .unwrap_or_else(|| s.finished_steps.join("\n"));
                let source = match s.source_id() {
                    "" => s.session_id.clone(),
                    src => src.to_string(),
                };
                match self.call(CallKind::Knowledge, cancel, kb.store(&content, &source)).await {
                    Ok(count) => {
                        tracing::info!(count, source = %source, "stored to knowledge base");
                        let step = s.current_step().to_string();
                        if !s.plan.as_ref().map(|p| p.declares_done).unwrap_or(true) {
                            s.record_finished(&step);
                        }
                        s.record_finished(&format!("{KNOWLEDGE_STORE_MARK} {count} records from {source}"));
                        s.step_fail_count = 0;
                        s.phase = Phase::Observe;
                        Ok(())
                    }
                    Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
                    Err(e) => self.on_failure(s, e, Phase::Plan),
                }
            }
            KnowledgeOp::Query => {
                let question = match s.current_step() {
                    "" => s.user_task.clone(),
                    step => step.to_string(),
                };
                match self.call(CallKind::Knowledge, cancel, kb.query(&question)).await {
                    Ok(answer) => {
                        self.emit(EngineEvent::KnowledgeAnswer {
                            preview: answer.chars().take(200).collect(),
                        });
                        s.outputs.push(answer);
                        s.record_finished(&question);
                        s.step_fail_count = 0;
                        s.phase = Phase::Observe;
                        Ok(())
                    }
                    Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
                    Err(e) => self.on_failure(s, e, Phase::Plan),
                }
            }
        }
    }

    /// 非执行类的外部调用失败：按恢复引擎的建议处理
    fn on_failure(&self, s: &mut TaskState, err: AgentError, retry_phase: Phase) -> Result<(), AgentError> {
        if err == AgentError::Cancelled {
            return Err(err);
        }
        tracing::warn!(phase = s.phase.as_str(), error = %err, "capability call failed");
        s.step_fail_count += 1;
        s.last_error = Some(err.to_string());
        s.push_reflection(format!("{} 失败: {err}", s.phase.as_str()));
        match self.recovery.handle(&err, u32::MAX, s.step_fail_count) {
            RecoveryAction::Abort => self.enter_error(s, err.to_string(), retry_phase),
            RecoveryAction::Replan {
                invalidate_perception: true,
            } => {
                s.force_fresh_perception = true;
                s.phase = Phase::Observe;
            }
            RecoveryAction::SkipCache => {
                s.cache_failed_this_round = true;
                s.phase = retry_phase;
            }
            _ => s.phase = retry_phase,
        }
        Ok(())
    }

    fn enter_error(&self, s: &mut TaskState, reason: String, resume_phase: Phase) {
        tracing::error!(session_id = %s.session_id, reason = %reason, "entering error state");
        self.emit(EngineEvent::Error { text: reason.clone() });
        s.last_error = Some(reason);
        s.error_resume_phase = Some(resume_phase);
        s.phase = Phase::Error;
    }

    async fn apply_directive(
        &self,
        s: &mut TaskState,
        directive: Directive,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        tracing::info!(session_id = %s.session_id, phase = s.phase.as_str(), ?directive, "applying directive");
        match (s.phase, directive) {
            (Phase::Paused(PausePoint::BeforeExecute), Directive::Approve) => {
                s.phase = Phase::Execute;
            }
            (Phase::Paused(PausePoint::BeforeExecute), Directive::Edit { script }) => {
                s.pending_script = Some(PendingScript {
                    code: script,
                    source: ScriptSource::Edited,
                });
                s.phase = Phase::Execute;
            }
            (Phase::Paused(_), Directive::Reject { reason }) => {
                s.last_verification = Some(Verification {
                    outcome: StepOutcome::StepFail(FailureKind::Rejected),
                    summary: format!("rejected by operator: {reason}"),
                    task_done_claimed: false,
                });
                self.apply_outcome(s, cancel).await?;
            }
            (Phase::Paused(PausePoint::AfterVerify), Directive::Approve) => {
                self.apply_outcome(s, cancel).await?;
            }
            (
                Phase::Paused(PausePoint::AfterVerify),
                Directive::OverrideVerification {
                    success,
                    task_done,
                    summary,
                },
            ) => {
                let verification = self.classifier.classify_override(success, task_done, summary, s);
                self.emit(EngineEvent::StepOutcome {
                    outcome: verification.outcome,
                    summary: verification.summary.clone(),
                });
                s.last_verification = Some(verification);
                self.apply_outcome(s, cancel).await?;
            }
            (Phase::Error, Directive::Approve) => {
                s.phase = s.error_resume_phase.take().unwrap_or(Phase::Plan);
                s.step_fail_count = 0;
                s.micro_retry_count = 0;
                s.loop_count = 0;
                s.last_error = None;
            }
            (phase, directive) => {
                return Err(AgentError::InvalidDirective(format!(
                    "{directive:?} is not valid in phase {}",
                    phase.as_str()
                )));
            }
        }
        Ok(())
    }
}
