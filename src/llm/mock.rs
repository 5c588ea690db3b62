//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按 RequestPurpose 维护脚本化响应队列；队列为空时给出确定性的兜底响应，
//! 便于本地跑通完整的编排流程。所有收到的请求都会记录下来供断言使用。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::types::{LlmRequest, LlmResponse, RequestPurpose, Role, ToolInvocation};
use crate::llm::{LlmClient, LlmError};

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    scripts: Mutex<HashMap<RequestPurpose, VecDeque<Result<LlmResponse, LlmError>>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为某一用途追加一条响应（FIFO）
    pub fn push(&self, purpose: RequestPurpose, response: Result<LlmResponse, LlmError>) {
        if let Ok(mut s) = self.scripts.lock() {
            s.entry(purpose).or_default().push_back(response);
        }
    }

    pub fn with(self, purpose: RequestPurpose, response: LlmResponse) -> Self {
        self.push(purpose, Ok(response));
        self
    }

    pub fn with_error(self, purpose: RequestPurpose, error: LlmError) -> Self {
        self.push(purpose, Err(error));
        self
    }

    pub fn with_tool_call(self, name: &str, arguments: serde_json::Value) -> Self {
        self.with(
            RequestPurpose::ActionSelection,
            LlmResponse::ToolCall(ToolInvocation {
                name: name.to_string(),
                arguments,
            }),
        )
    }

    /// 已收到的全部请求（按顺序）
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, purpose: RequestPurpose) -> usize {
        self.requests
            .lock()
            .map(|r| r.iter().filter(|q| q.purpose == purpose).count())
            .unwrap_or(0)
    }

    fn fallback(request: &LlmRequest) -> LlmResponse {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        match request.purpose {
            RequestPurpose::Planning => LlmResponse::Structured(json!({
                "tasks": [{"id": 1, "description": last_user, "done": false}]
            })),
            RequestPurpose::TaskValidation => {
                LlmResponse::Structured(json!({"done": true, "reason": "mock"}))
            }
            RequestPurpose::SessionValidation => {
                LlmResponse::Structured(json!({"answered": true, "missing": null}))
            }
            RequestPurpose::ActionSelection => LlmResponse::Text("No further action needed.".into()),
            RequestPurpose::Synthesis | RequestPurpose::ImageAnalysis => {
                LlmResponse::Text(format!("Mock answer: {last_user}"))
            }
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(request.clone());
        }
        let scripted = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(&request.purpose).and_then(|q| q.pop_front()));
        scripted.unwrap_or_else(|| Ok(Self::fallback(request)))
    }
}
