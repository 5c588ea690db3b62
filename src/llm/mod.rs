//! LLM 层：请求/响应类型、客户端抽象、推理网关（重试）与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;
pub mod types;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError, RetryClassifier, RetryConfig, RetryingLlmClient};
pub use types::{
    extract_json, ImageAttachment, LlmRequest, LlmResponse, Message, RequestPurpose, Role,
    ToolChoice, ToolInvocation, ToolSpec,
};
