//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供编排循环决定是放弃任务、降级继续还是终止会话。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作（放弃任务 / 降级 / 终止）
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::ReasoningUnavailable(_) => RecoveryAction::AbandonTask,
            AgentError::MalformedResponse(_) => RecoveryAction::Degrade,
            // 单个工具失败已作为证据写回，不影响会话
            AgentError::Tool(_) => RecoveryAction::Degrade,
            AgentError::ReasoningRejected(_)
            | AgentError::ConfigError(_)
            | AgentError::RegistryError(_) => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolError;
    use crate::llm::LlmError;

    #[test]
    fn test_recovery_exhausted_retries_abandons_task() {
        let engine = RecoveryEngine::new();
        let err = AgentError::from(LlmError::RetriesExhausted {
            attempts: 3,
            last: Box::new(LlmError::Timeout),
        });
        assert_eq!(engine.handle(&err), RecoveryAction::AbandonTask);
    }

    #[test]
    fn test_recovery_auth_failure_aborts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::from(LlmError::Auth("bad key".to_string()));
        assert!(matches!(err, AgentError::ReasoningRejected(_)));
        assert_eq!(engine.handle(&err), RecoveryAction::Abort);
    }

    #[test]
    fn test_recovery_malformed_response_degrades() {
        let engine = RecoveryEngine::new();
        let err = AgentError::from(LlmError::Decode("not json".to_string()));
        assert_eq!(engine.handle(&err), RecoveryAction::Degrade);
    }

    #[test]
    fn test_recovery_tool_error_never_aborts() {
        let engine = RecoveryEngine::new();
        let err = AgentError::from(ToolError::invalid_arguments("missing patient_id"));
        assert_ne!(engine.handle(&err), RecoveryAction::Abort);
    }
}
