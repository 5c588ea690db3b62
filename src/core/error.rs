//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 AbandonTask / Degrade / Abort。
//! ToolError 不在此列：工具失败永远作为证据写回日志，不会中断会话。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// 工具错误种类（写入 ToolOutput.error，供下一轮 Action Selector 参考）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// 参数未通过 schema 校验
    InvalidArguments,
    /// 推理服务给出了未注册的工具名
    UnknownTool,
    /// 底层数据不存在（患者、影像文件等）
    MissingData,
    /// 工具内部执行失败
    ExecutionFailed,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::InvalidArguments => "invalid_arguments",
            ToolErrorKind::UnknownTool => "unknown_tool",
            ToolErrorKind::MissingData => "missing_data",
            ToolErrorKind::ExecutionFailed => "execution_failed",
        }
    }
}

/// 工具错误：在工具循环内本地恢复，从不升级为会话失败
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{}: {message}", .kind.as_str())]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InvalidArguments, message)
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(ToolErrorKind::UnknownTool, format!("Unknown tool: {name}"))
    }

    pub fn missing_data(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::MissingData, message)
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::ExecutionFailed, message)
    }
}

/// Agent 运行过程中可能出现的错误（推理服务、配置、注册表）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 可重试错误已耗尽重试次数：放弃当前任务，会话继续
    #[error("Reasoning service unavailable: {0}")]
    ReasoningUnavailable(LlmError),

    /// 终止性错误（鉴权失败、请求格式错误）：会话进入 ABORTED
    #[error("Reasoning service rejected request: {0}")]
    ReasoningRejected(LlmError),

    /// 推理服务返回内容无法解码为期望结构
    #[error("Malformed reasoning response: {0}")]
    MalformedResponse(String),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Config error: {0}")]
    ConfigError(String),

    /// 启动时工具注册表校验失败（重名、非法 schema）
    #[error("Tool registry error: {0}")]
    RegistryError(String),
}

impl From<LlmError> for AgentError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Decode(msg) => AgentError::MalformedResponse(msg),
            LlmError::Auth(_) | LlmError::InvalidRequest(_) => AgentError::ReasoningRejected(err),
            other => AgentError::ReasoningUnavailable(other),
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 放弃当前任务并推进到下一个任务
    AbandonTask,
    /// 降级继续：使用本地兜底结果（如单任务计划、跳过校验）
    Degrade,
    /// 终止会话，进入 ABORTED（仍会尽力合成部分答案）
    Abort,
}
