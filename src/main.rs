//! AutoWeb - 网页自动化编排
//!
//! 入口：加载配置、初始化日志、构建编排器，运行命令行给出的任务。
//!
//! 用法：`autoweb [--config PATH] [--session ID] [--interactive] [--resume] <任务描述>...`
//! - `--interactive` 在两个暂停点从标准输入读取指令（回车批准，`r 原因` 拒绝，`e` 后跟多行脚本以 `.` 结束）
//! - `--resume` 不提交新任务，从会话断点继续

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use autoweb::capability::{ApprovalChannel, AutoApprove, PendingApproval};
use autoweb::config::load_config;
use autoweb::core::{Directive, EngineBuilder, PausePoint, Phase, RunStatus, SessionRegistry};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "autoweb", about = "Checkpointed web automation with perception and action caches")]
struct Cli {
    /// Path to a TOML config file (defaults to config/default.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Session id; a new one is generated when omitted
    #[arg(long)]
    session: Option<String>,
    /// Pause before execute and after verify, reading directives from stdin
    #[arg(long)]
    interactive: bool,
    /// Continue the session from its checkpoint instead of submitting a task
    #[arg(long)]
    resume: bool,
    /// Task description
    #[arg(required_unless_present = "resume", trailing_var_arg = true)]
    task: Vec<String>,
}

impl Cli {
    fn task(&self) -> String {
        self.task.join(" ")
    }
}

/// 从标准输入读取人工指令
struct StdinApproval;

#[async_trait]
impl ApprovalChannel for StdinApproval {
    async fn request_approval(&self, pending: &PendingApproval) -> Directive {
        println!("\n=== paused: {:?} ===", pending.point);
        println!("step: {}", pending.step);
        if let Some(script) = &pending.script {
            println!("--- script ---\n{script}\n--------------");
        }
        if let Some(v) = &pending.verification {
            println!("verification: {:?} - {}", v.outcome, v.summary);
        }
        println!("[enter] approve | r <reason> reject | e edit script | ok/fail <summary> override");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let Ok(Some(line)) = lines.next_line().await else {
            return Directive::Approve;
        };
        let line = line.trim();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("r", reason) => Directive::Reject {
                reason: reason.to_string(),
            },
            ("e", _) if pending.point == PausePoint::BeforeExecute => {
                println!("enter the new script, finish with a single '.' line");
                let mut script = Vec::new();
                while let Ok(Some(l)) = lines.next_line().await {
                    if l.trim() == "." {
                        break;
                    }
                    script.push(l);
                }
                Directive::Edit {
                    script: script.join("\n"),
                }
            }
            (verdict @ ("ok" | "done" | "fail"), summary) if pending.point == PausePoint::AfterVerify => {
                Directive::OverrideVerification {
                    success: verdict != "fail",
                    task_done: verdict == "done",
                    summary: summary.to_string(),
                }
            }
            _ => Directive::Approve,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    autoweb::observability::init();

    let args = Cli::parse();
    if !args.resume && args.task().trim().is_empty() {
        anyhow::bail!("task description is empty");
    }
    let mut cfg = load_config(args.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });
    if args.interactive {
        cfg.orchestrator.pause_before_execute = true;
        cfg.orchestrator.pause_after_verify = true;
    }

    let orchestrator = EngineBuilder::new(cfg)
        .build()
        .context("Failed to build orchestrator")?;

    let registry = SessionRegistry::new();
    registry.install_signal_handlers();
    let session_id = args
        .session
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let cancel = registry.token(&session_id);
    tracing::info!(session_id = %session_id, "session started");

    let approval: Box<dyn ApprovalChannel> = if args.interactive {
        Box::new(StdinApproval)
    } else {
        Box::new(AutoApprove)
    };

    let result = if args.resume {
        // Error 状态的会话先批准恢复
        let mut report = match orchestrator.load(&session_id) {
            Ok(state) if state.phase == Phase::Error => {
                orchestrator.resume(&session_id, Directive::Approve, &cancel).await
            }
            _ => orchestrator.run_until_pause(&session_id, &cancel).await,
        };
        while let Ok(r) = &report {
            let RunStatus::Paused(point) = r.status else { break };
            let pending = PendingApproval {
                session_id: session_id.clone(),
                point,
                step: r.state.current_step().to_string(),
                script: r.state.pending_script.as_ref().map(|p| p.code.clone()),
                verification: r.state.last_verification.clone(),
            };
            let directive = approval.request_approval(&pending).await;
            report = orchestrator.resume(&session_id, directive, &cancel).await;
        }
        report
    } else {
        orchestrator
            .run(&session_id, &args.task(), approval.as_ref(), &cancel)
            .await
    };
    registry.finish(&session_id);

    let report = result.context("Task run failed")?;
    for output in &report.state.outputs {
        println!("{output}");
    }
    match report.status {
        RunStatus::Completed => {
            println!("completed: {} steps", report.state.finished_steps.len());
            for step in &report.state.finished_steps {
                println!("  - {step}");
            }
        }
        RunStatus::Failed(reason) => {
            println!("failed: {reason} (resume with --session {session_id} --resume)");
        }
        RunStatus::Paused(point) => println!("paused at {point:?}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_collects_task_words_after_flags() {
        let cli = Cli::try_parse_from(["autoweb", "--session", "s1", "--interactive", "search", "sea", "--now"]).unwrap();
        assert_eq!(cli.session.as_deref(), Some("s1"));
        assert!(cli.interactive);
        assert!(!cli.resume);
        assert_eq!(cli.task(), "search sea --now");
    }

    #[test]
    fn test_cli_requires_task_unless_resuming() {
        assert!(Cli::try_parse_from(["autoweb", "--session", "s1"]).is_err());
        let cli = Cli::try_parse_from(["autoweb", "--resume", "--session", "s1"]).unwrap();
        assert!(cli.resume && cli.task.is_empty());
    }

    #[test]
    fn test_cli_option_needs_value_before_task() {
        assert!(Cli::try_parse_from(["autoweb", "--config"]).is_err());
        // 任务开始后的词都属于任务
        let cli = Cli::try_parse_from(["autoweb", "search", "--config"]).unwrap();
        assert!(cli.config.is_none());
        assert_eq!(cli.task(), "search --config");
    }
}
