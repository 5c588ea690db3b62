//! 核心编排层：错误与恢复、会话状态机、Agent 构建与调用边界

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod state;

pub use builder::AgentBuilder;
pub use error::{AgentError, RecoveryAction, ToolError, ToolErrorKind};
pub use orchestrator::{compose_query, create_llm_from_config, Agent};
pub use recovery::RecoveryEngine;
pub use state::{AbortReason, Phase, SessionState, StepBudget, Task, TaskStatus};
