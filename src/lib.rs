//! AutoWeb - 带双层语义缓存与断点恢复的网页自动化编排
//!
//! 模块划分：
//! - **cache**: 环境指纹、L1 感知缓存（TTL）、L2 动作缓存（三维加权检索）、参数差分与替换
//! - **capability**: 外部能力接口（感知、规划、生成、执行环境、判定、知识库、人工审批）及 LLM / 浏览器实现
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务状态、断点存储、路由、结果分类、错误恢复、编排状态机
//! - **llm**: LLM 与嵌入客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: 日志初始化

pub mod cache;
pub mod capability;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;

pub use crate::core::{Directive, EngineBuilder, Orchestrator, RunReport, RunStatus, TaskState};
