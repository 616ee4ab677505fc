//! 步骤结果分类
//!
//! 把执行结果与判定结论映射为 STEP_FAIL / STEP_SUCCESS_CONTINUE / STEP_SUCCESS_DONE。
//! DONE 的前提：判定器或规划器声称完成，且已完成步骤清单（含本步骤）覆盖规划中的全部子步骤。

use crate::cache::VerifiedScript;
use crate::capability::{ExecutionResult, Verdict};
use crate::core::state::{FailureKind, PendingScript, StepOutcome, TaskState, Verification};

/// 语法 / 名称 / 类型类错误：可在本步骤内微重试
const SYNTAX_ERRORS: [&str; 6] = [
    "SyntaxError",
    "IndentationError",
    "NameError",
    "TypeError",
    "AttributeError",
    "ReferenceError",
];

/// 定位类错误：环境与感知结果不一致
const LOCATOR_ERRORS: [&str; 6] = [
    "ElementNotFound",
    "TimeoutException",
    "NoSuchElement",
    "ElementNotInteractable",
    "StaleElement",
    "Node is detached",
];

/// 输出中出现即视为失败
const FATAL_MARKERS: [&str; 6] = [
    "Runtime Error:",
    "Traceback",
    "ElementNotFound",
    "TimeoutException",
    "Execution Failed",
    "Critical",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct OutcomeClassifier;

impl OutcomeClassifier {
    pub fn new() -> Self {
        Self
    }

    /// 按错误文本判断失败类别
    pub fn fault_kind(&self, error: &str) -> FailureKind {
        if SYNTAX_ERRORS.iter().any(|k| error.contains(k)) {
            FailureKind::Transient
        } else if LOCATOR_ERRORS.iter().any(|k| error.contains(k)) {
            FailureKind::EnvironmentMismatch
        } else if error.starts_with("Timeout") || error.contains("timed out") {
            FailureKind::Timeout
        } else {
            FailureKind::Runtime
        }
    }

    pub fn fatal_marker(&self, output: &str) -> Option<&'static str> {
        FATAL_MARKERS.iter().copied().find(|m| output.contains(m))
    }

    /// 仅看执行结果即可判定的失败（无需调用判定器）
    pub fn execution_failure(&self, result: &ExecutionResult) -> Option<(FailureKind, String)> {
        if !result.success {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "execution failed without error message".to_string());
            return Some((self.fault_kind(&error), error));
        }
        self.fatal_marker(&result.output).map(|marker| {
            (
                self.fault_kind(&result.output),
                format!("output contains fatal marker '{marker}'"),
            )
        })
    }

    /// 分类；verdict 为 None 表示未配置判定器
    pub fn classify(&self, result: &ExecutionResult, verdict: Option<&Verdict>, state: &TaskState) -> Verification {
        if let Some((kind, summary)) = self.execution_failure(result) {
            return Verification {
                outcome: StepOutcome::StepFail(kind),
                summary,
                task_done_claimed: false,
            };
        }
        match verdict {
            Some(v) if !v.success => Verification {
                outcome: StepOutcome::StepFail(FailureKind::Runtime),
                summary: v.summary.clone(),
                task_done_claimed: false,
            },
            Some(v) => self.success(state, v.task_done, v.summary.clone()),
            None => {
                let summary = if result.output.trim().is_empty() {
                    "step executed".to_string()
                } else {
                    result.output.chars().take(200).collect()
                };
                self.success(state, false, summary)
            }
        }
    }

    /// 人工覆盖判定结论；DONE 仍受已完成步骤清单约束
    pub fn classify_override(&self, success: bool, task_done: bool, summary: String, state: &TaskState) -> Verification {
        if !success {
            return Verification {
                outcome: StepOutcome::StepFail(FailureKind::Rejected),
                summary,
                task_done_claimed: false,
            };
        }
        self.success(state, task_done, summary)
    }

    fn success(&self, state: &TaskState, verdict_done: bool, summary: String) -> Verification {
        let plan = state.plan.as_ref();
        let claimed = verdict_done || plan.map(|p| p.declares_done).unwrap_or(false);
        let covered = state.completion_covered(plan.map(|p| p.current_step.as_str()));
        let outcome = if claimed && covered {
            StepOutcome::StepSuccessDone
        } else {
            if claimed {
                tracing::info!("completion claimed but plan steps remain unfinished");
            }
            StepOutcome::StepSuccessContinue
        };
        Verification {
            outcome,
            summary,
            task_done_claimed: claimed,
        }
    }

    /// 只有成功的结论才能把脚本认证为可缓存；复用来的脚本不重复写入
    pub fn certify(&self, verification: &Verification, script: &PendingScript) -> Option<VerifiedScript> {
        if !verification.outcome.is_success() || script.cached_entry().is_some() {
            return None;
        }
        Some(VerifiedScript::new(script.code.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Plan;
    use crate::core::state::ScriptSource;

    fn state_with_plan(ledger: &[&str], current: &str, required: &[&str], declares_done: bool) -> TaskState {
        let mut s = TaskState::new("s", "t");
        for step in ledger {
            s.record_finished(step);
        }
        s.plan = Some(Plan {
            text: String::new(),
            current_step: current.to_string(),
            required_steps: required.iter().map(|x| x.to_string()).collect(),
            declares_done,
        });
        s
    }

    fn done_verdict() -> Verdict {
        Verdict {
            success: true,
            task_done: true,
            summary: "looks finished".into(),
        }
    }

    #[test]
    fn test_done_requires_full_ledger() {
        let c = OutcomeClassifier::new();
        let state = state_with_plan(&["step1"], "step1", &["step1", "step2"], true);
        let v = c.classify(&ExecutionResult::ok("ok"), Some(&done_verdict()), &state);
        assert_eq!(v.outcome, StepOutcome::StepSuccessContinue);
        assert!(v.task_done_claimed);
    }

    #[test]
    fn test_done_when_current_step_completes_plan() {
        let c = OutcomeClassifier::new();
        let state = state_with_plan(&["step1"], "step2", &["step1", "step2"], false);
        let v = c.classify(&ExecutionResult::ok("ok"), Some(&done_verdict()), &state);
        assert_eq!(v.outcome, StepOutcome::StepSuccessDone);
    }

    #[test]
    fn test_done_plan_without_checklist_uses_remembered_steps() {
        let c = OutcomeClassifier::new();
        let mut state = state_with_plan(&["step1"], "", &[], true);
        state.plan_checklist = vec!["step1".to_string(), "step2".to_string()];
        let v = c.classify(&ExecutionResult::ok("ok"), Some(&done_verdict()), &state);
        assert_eq!(v.outcome, StepOutcome::StepSuccessContinue);

        state.record_finished("step2");
        let v = c.classify(&ExecutionResult::ok("ok"), Some(&done_verdict()), &state);
        assert_eq!(v.outcome, StepOutcome::StepSuccessDone);
    }

    #[test]
    fn test_done_claim_without_any_progress_continues() {
        let c = OutcomeClassifier::new();
        let state = state_with_plan(&[], "", &[], true);
        let v = c.classify(&ExecutionResult::ok("ok"), Some(&done_verdict()), &state);
        assert_eq!(v.outcome, StepOutcome::StepSuccessContinue);
        assert!(v.task_done_claimed);
    }

    #[test]
    fn test_success_without_claim_continues() {
        let c = OutcomeClassifier::new();
        let state = state_with_plan(&[], "step1", &["step1"], false);
        let v = c.classify(&ExecutionResult::ok("clicked"), None, &state);
        assert_eq!(v.outcome, StepOutcome::StepSuccessContinue);
    }

    #[test]
    fn test_execution_error_kinds() {
        let c = OutcomeClassifier::new();
        let state = state_with_plan(&[], "s", &[], false);
        let cases = [
            ("SyntaxError: unexpected token", FailureKind::Transient),
            ("ElementNotFound: #login", FailureKind::EnvironmentMismatch),
            ("Timeout: execution", FailureKind::Timeout),
            ("boom", FailureKind::Runtime),
        ];
        for (err, kind) in cases {
            let v = c.classify(&ExecutionResult::failed(err), Some(&done_verdict()), &state);
            assert_eq!(v.outcome, StepOutcome::StepFail(kind), "{err}");
        }
    }

    #[test]
    fn test_fatal_marker_in_output_fails() {
        let c = OutcomeClassifier::new();
        let state = state_with_plan(&[], "s", &[], false);
        let v = c.classify(
            &ExecutionResult::ok("Traceback (most recent call last): ..."),
            Some(&done_verdict()),
            &state,
        );
        assert_eq!(v.outcome, StepOutcome::StepFail(FailureKind::Runtime));
    }

    #[test]
    fn test_negative_verdict_fails() {
        let c = OutcomeClassifier::new();
        let state = state_with_plan(&[], "s", &[], false);
        let verdict = Verdict {
            success: false,
            task_done: false,
            summary: "page unchanged".into(),
        };
        let v = c.classify(&ExecutionResult::ok("ok"), Some(&verdict), &state);
        assert_eq!(v.outcome, StepOutcome::StepFail(FailureKind::Runtime));
        assert_eq!(v.summary, "page unchanged");
    }

    #[test]
    fn test_override_respects_ledger() {
        let c = OutcomeClassifier::new();
        let state = state_with_plan(&[], "step1", &["step1", "step2"], false);
        let v = c.classify_override(true, true, "operator says done".into(), &state);
        assert_eq!(v.outcome, StepOutcome::StepSuccessContinue);
        let v = c.classify_override(false, false, "nope".into(), &state);
        assert_eq!(v.outcome, StepOutcome::StepFail(FailureKind::Rejected));
    }

    #[test]
    fn test_certify_only_success_and_not_cached() {
        let c = OutcomeClassifier::new();
        let ok = Verification {
            outcome: StepOutcome::StepSuccessContinue,
            summary: String::new(),
            task_done_claimed: false,
        };
        let fail = Verification {
            outcome: StepOutcome::StepFail(FailureKind::Runtime),
            ..ok.clone()
        };
        let generated = PendingScript {
            code: "x".into(),
            source: ScriptSource::Generated,
        };
        let cached = PendingScript {
            code: "x".into(),
            source: ScriptSource::Cached { entry_id: "e".into() },
        };
        assert!(c.certify(&ok, &generated).is_some());
        assert!(c.certify(&fail, &generated).is_none());
        assert!(c.certify(&ok, &cached).is_none());
    }
}
