//! 基于 LLM 的感知、规划、代码生成与步骤判定
//!
//! 每个能力只负责拼提示词与解析回复；超时、重试、缓存都由编排器处理。

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use crate::cache::EnvironmentSnapshot;
use crate::capability::{
    ExecutionResult, GenerationCapability, GenerationRequest, LocatorStrategy, LocatorTarget,
    PerceptionCapability, Plan, PlanningCapability, PlanningContext, StepJudge, Verdict,
};
use crate::core::state::normalize_step;
use crate::core::AgentError;
use crate::llm::{LlmClient, Message};

/// 规划回复中的标记
pub const PLAN_TAG: &str = "【计划已生成】";
pub const DONE_TAG: &str = "【任务已完成】";

/// 感知提示中的结构文本上限
const PERCEPTION_STRUCTURE_CHARS: usize = 12000;

async fn ask(llm: &Arc<dyn LlmClient>, capability: &'static str, system: &str, user: String) -> Result<String, AgentError> {
    let messages = vec![Message::system(system), Message::user(user)];
    llm.complete(&messages)
        .await
        .map_err(|e| AgentError::capability(capability, e))
}

fn bullet_list(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return empty.to_string();
    }
    items
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {}", i + 1, s))
        .collect::<Vec<_>>()
        .join("\n")
}

fn strategy_text(strategy: Option<&LocatorStrategy>) -> String {
    match strategy {
        Some(s) if !s.is_empty() => {
            let mut text = s.method_hints();
            if !s.rationale.is_empty() {
                text.push_str("\n说明: ");
                text.push_str(&s.rationale);
            }
            text
        }
        _ => "(无)".to_string(),
    }
}

// ---------------------------------------------------------------------------
// 感知
// ---------------------------------------------------------------------------

const PERCEPTION_SYSTEM: &str = "你是网页结构分析专家。根据页面结构为当前任务推导稳健的元素定位方式（CSS 选择器或 XPath），只输出 JSON。";

pub struct LlmPerception {
    llm: Arc<dyn LlmClient>,
}

impl LlmPerception {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl PerceptionCapability for LlmPerception {
    async fn analyze(&self, snapshot: &EnvironmentSnapshot, task: &str) -> Result<LocatorStrategy, AgentError> {
        let structure: String = snapshot.structure.chars().take(PERCEPTION_STRUCTURE_CHARS).collect();
        let prompt = format!(
            "【用户任务】\n{task}\n\n【当前页面】\n{}\n\n【页面结构】\n{structure}\n\n\
             请输出 JSON：{{\"targets\": {{\"目标名\": {{\"locator\": \"选择器\", \"reason\": \"理由\"}}}}, \"rationale\": \"整体说明\"}}\n\
             禁止使用绝对路径，优先使用 id、name、稳定的 class。",
            snapshot.source_id
        );
        let reply = ask(&self.llm, "perception", PERCEPTION_SYSTEM, prompt).await?;
        parse_strategy(&reply)
            .ok_or_else(|| AgentError::capability("perception", "reply contains no locator strategy"))
    }
}

fn json_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("valid fenced json regex"))
}

/// 解析定位策略：支持 {"targets": {...}} 与扁平的 {"名字": "选择器"}；
/// 模型偶尔连续输出多个对象（`}{`），合并为一个
pub fn parse_strategy(reply: &str) -> Option<LocatorStrategy> {
    let body = json_object_re()
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(reply);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end < start {
        return None;
    }
    let raw = &body[start..=end];

    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => {
            let repaired = format!("[{}]", raw.replace("}{", "},{").replace("}\n{", "},\n{"));
            let parts: Vec<serde_json::Value> = serde_json::from_str(&repaired).ok()?;
            let mut merged = serde_json::Map::new();
            for part in parts {
                if let serde_json::Value::Object(map) = part {
                    merged.extend(map);
                }
            }
            serde_json::Value::Object(merged)
        }
    };
    let obj = value.as_object()?;

    let rationale = obj
        .get("rationale")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let source = match obj.get("targets").and_then(|t| t.as_object()) {
        Some(targets) => targets.clone(),
        None => obj
            .iter()
            .filter(|(k, _)| k.as_str() != "rationale")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };

    let mut targets = BTreeMap::new();
    for (name, v) in source {
        let target = match v {
            serde_json::Value::String(locator) => LocatorTarget::new(locator, ""),
            serde_json::Value::Object(ref m) => {
                let Some(locator) = m
                    .get("locator")
                    .or_else(|| m.get("selector"))
                    .or_else(|| m.get("xpath"))
                    .and_then(|l| l.as_str())
                else {
                    continue;
                };
                let reason = m.get("reason").and_then(|r| r.as_str()).unwrap_or_default();
                LocatorTarget::new(locator, reason)
            }
            _ => continue,
        };
        if !target.locator.trim().is_empty() {
            targets.insert(name, target);
        }
    }
    if targets.is_empty() {
        return None;
    }
    Some(LocatorStrategy { targets, rationale })
}

// ---------------------------------------------------------------------------
// 规划
// ---------------------------------------------------------------------------

const PLANNER_SYSTEM: &str = "你是精通网页自动化的规划专家，采用迭代式规划：每轮只推进一步。";

pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn prompt(ctx: &PlanningContext) -> String {
        let mut prompt = format!(
            "【用户最终目标】\n{}\n\n【当前页面】\n{}\n\n【已完成步骤】\n{}\n\n【定位建议】\n{}\n\n【之前的失败教训】\n{}\n",
            ctx.user_task,
            if ctx.source_id.is_empty() { "(空白页)" } else { ctx.source_id.as_str() },
            bullet_list(&ctx.finished_steps, "(无)"),
            strategy_text(ctx.strategy.as_ref()),
            bullet_list(&ctx.reflections, "(无)"),
        );
        if let Some(summary) = &ctx.last_summary {
            prompt.push_str(&format!("\n【上一步结果】\n{summary}\n"));
        }
        if ctx.force_alternative {
            prompt.push_str("\n⚠️ 同一步骤已连续失败多次，必须换一种完全不同的做法（不同的元素、入口或路径）。\n");
        }
        if !ctx.structure_excerpt.is_empty() {
            prompt.push_str(&format!("\n【页面结构摘要】\n{}\n", ctx.structure_excerpt));
        }
        prompt.push_str(&format!(
            "\n回复格式：\n- 未完成时输出 \"{PLAN_TAG}\"，随后用编号列出完成整个任务所需的全部步骤（含已完成的），每行一步。\n\
             - 目标彻底达成时输出 \"{DONE_TAG}\" 和一句总结。\n"
        ));
        prompt
    }
}

#[async_trait]
impl PlanningCapability for LlmPlanner {
    async fn plan(&self, ctx: &PlanningContext) -> Result<Plan, AgentError> {
        let reply = ask(&self.llm, "planning", PLANNER_SYSTEM, Self::prompt(ctx)).await?;
        parse_plan(&reply, &ctx.finished_steps)
            .ok_or_else(|| AgentError::capability("planning", "reply contains neither a plan nor a completion tag"))
    }
}

fn numbered_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:\d+[.)、:]|[-*•])\s*(.+?)\s*$").expect("valid numbered regex"))
}

/// 解析规划回复：两个标记同时出现时以计划为准；
/// 当前步骤是编号列表中第一个尚未完成的步骤
pub fn parse_plan(reply: &str, finished_steps: &[String]) -> Option<Plan> {
    let has_plan = reply.contains(PLAN_TAG);
    let has_done = reply.contains(DONE_TAG);
    if has_plan && has_done {
        tracing::info!("planner emitted both tags, keeping the plan");
    }

    let body = match reply.find(PLAN_TAG) {
        Some(idx) => &reply[idx + PLAN_TAG.len()..],
        None => reply,
    };
    let steps: Vec<String> = body
        .lines()
        .filter_map(|line| numbered_re().captures(line))
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|s| !s.contains(DONE_TAG))
        .collect();

    if !has_plan {
        if has_done {
            return Some(Plan {
                text: reply.trim().to_string(),
                current_step: String::new(),
                required_steps: steps,
                declares_done: true,
            });
        }
        return None;
    }

    let finished: Vec<String> = finished_steps.iter().map(|s| normalize_step(s)).collect();
    let current = steps
        .iter()
        .find(|s| !finished.contains(&normalize_step(s)))
        .or(steps.last())
        .cloned()
        .or_else(|| {
            body.lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        })?;
    let all_finished = !steps.is_empty() && steps.iter().all(|s| finished.contains(&normalize_step(s)));
    Some(Plan {
        text: reply.trim().to_string(),
        current_step: current,
        required_steps: steps,
        declares_done: all_finished,
    })
}

// ---------------------------------------------------------------------------
// 代码生成
// ---------------------------------------------------------------------------

const CODER_SYSTEM: &str = "你是浏览器自动化专家，编写在页面中直接执行的 JavaScript。只实现计划中的这一步，不做计划之外的事。";

pub struct LlmGenerator {
    llm: Arc<dyn LlmClient>,
}

impl LlmGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl GenerationCapability for LlmGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, AgentError> {
        let mut prompt = format!(
            "【用户任务】\n{}\n\n【本步骤计划】\n{}\n\n【当前页面】\n{}\n\n【定位策略】\n{}\n",
            request.user_task,
            request.step,
            request.source_id,
            strategy_text(request.strategy.as_ref()),
        );
        if let Some(feedback) = &request.feedback {
            prompt.push_str(&format!("\n【上一次的错误】\n{feedback}\n"));
        }
        prompt.push_str(
            "\n要求：\n1. 用 ```javascript 代码块输出完整脚本\n2. 字符串参数用引号字面量书写\n\
             3. 找不到元素时 throw new Error('ElementNotFound: ...')\n4. 用 return 返回执行结果的简短描述\n",
        );
        let reply = ask(&self.llm, "generation", CODER_SYSTEM, prompt).await?;
        let code = extract_code(&reply);
        if code.trim().is_empty() {
            return Err(AgentError::capability("generation", "reply contains no script"));
        }
        Ok(code)
    }
}

fn code_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)```").expect("valid code block regex"))
}

/// 取第一个代码块；没有代码块时整段回复即脚本
pub fn extract_code(reply: &str) -> String {
    code_block_re()
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| reply.trim().to_string())
}

// ---------------------------------------------------------------------------
// 判定
// ---------------------------------------------------------------------------

const JUDGE_SYSTEM: &str = "你是自动化测试验收员。警告不算失败，只有导致任务无法继续的错误才算失败。";

pub struct LlmJudge {
    llm: Arc<dyn LlmClient>,
}

impl LlmJudge {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl StepJudge for LlmJudge {
    async fn judge(&self, plan: &Plan, result: &ExecutionResult, source_id: &str) -> Result<Verdict, AgentError> {
        let log: String = result.output.chars().take(4000).collect();
        let prompt = format!(
            "【当前计划】\n{}\n\n【当前页面】\n{source_id}\n\n【执行日志】\n{log}\n\n\
             格式:\nStatus: [STEP_SUCCESS | STEP_FAIL]\nSummary: [简短描述]\nTaskDone: [yes | no]（整个任务是否已经达成）\n",
            plan.current_step
        );
        let reply = ask(&self.llm, "verification", JUDGE_SYSTEM, prompt).await?;
        Ok(parse_verdict(&reply))
    }
}

/// 解析判定回复；没有 Status 行视为失败
pub fn parse_verdict(reply: &str) -> Verdict {
    let success = reply.contains("Status: STEP_SUCCESS");
    let mut summary = String::new();
    let mut task_done = false;
    for line in reply.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("Summary:") {
            summary = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("TaskDone:") {
            task_done = rest.trim().to_lowercase().starts_with("yes");
        }
    }
    if reply.contains(DONE_TAG) {
        task_done = true;
    }
    if summary.is_empty() {
        summary = reply.trim().chars().take(200).collect();
    }
    Verdict {
        success,
        task_done: success && task_done,
        summary,
    }
}
