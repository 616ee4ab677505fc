//! 可观测性：结构化日志
//!
//! 默认 info 级别，可通过 RUST_LOG 覆盖；审计日志（capability_audit / script_audit）以 JSON 字段输出。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认过滤指令
const DEFAULT_DIRECTIVE: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer())
        .init();
}

/// 测试或多次初始化时使用：已有全局 subscriber 时静默跳过
pub fn try_init() -> bool {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_test_writer())
        .try_init()
        .is_ok()
}
