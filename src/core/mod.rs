//! 核心编排层：状态、断点、路由、结果分类、错误恢复、会话取消与主状态机

pub mod builder;
pub mod checkpoint;
pub mod classifier;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod recovery;
pub mod router;
pub mod session;
pub mod state;

pub use builder::EngineBuilder;
pub use checkpoint::{
    create_checkpoint_store, CheckpointError, CheckpointRecord, CheckpointStore, FileCheckpointStore,
    InMemoryCheckpointStore, SqliteCheckpointStore,
};
pub use classifier::OutcomeClassifier;
pub use error::{AgentError, RecoveryAction};
pub use events::EngineEvent;
pub use orchestrator::{Orchestrator, RunReport, RunStatus};
pub use recovery::RecoveryEngine;
pub use router::{RouteTag, Router, KNOWLEDGE_STORE_MARK};
pub use session::SessionRegistry;
pub use state::{
    CacheFeedback, Directive, FailureKind, KnowledgeOp, ObservedEnvironment, PausePoint, Phase, PendingScript, ScriptSource,
    StepOutcome, TaskState, Verification,
};
