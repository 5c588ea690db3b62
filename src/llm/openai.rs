//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持工具目录、强制工具选择、
//! json_schema 结构化输出与内联图片。错误映射为 LlmError 供推理网关分类。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::{ApiError, OpenAIError};
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestMessageContentPartImageArgs, ChatCompletionRequestMessageContentPartTextArgs,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, ImageUrlArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::types::{LlmRequest, LlmResponse, Message, Role, ToolChoice, ToolInvocation};
use crate::llm::{LlmClient, LlmError};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

fn build_error(e: impl std::fmt::Display) -> LlmError {
    LlmError::InvalidRequest(format!("failed to build chat request: {e}"))
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: &str,
        timeout: Duration,
        max_tokens: u32,
    ) -> Result<Self, LlmError> {
        let config = match base_url {
            Some(url) => OpenAIConfig::new()
                .with_api_base(url.trim_end_matches('/'))
                .with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::InvalidRequest(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client: Client::with_config(config).with_http_client(http),
            model: model.to_string(),
            max_tokens,
            usage: TokenUsage::new(),
        })
    }

    /// 转换消息；图片作为内容分片挂到最后一条 user 消息上
    fn to_openai_messages(
        &self,
        request: &LlmRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let image_target = if request.images.is_empty() {
            None
        } else {
            request.messages.iter().rposition(|m| m.role == Role::User)
        };

        request
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| match m.role {
                Role::System => Ok(ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(build_error)?,
                )),
                Role::User if image_target == Some(i) => self.user_with_images(m, request),
                Role::User => Ok(ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(build_error)?,
                )),
                Role::Assistant => Ok(ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(build_error)?,
                )),
            })
            .collect()
    }

    fn user_with_images(
        &self,
        m: &Message,
        request: &LlmRequest,
    ) -> Result<ChatCompletionRequestMessage, LlmError> {
        let mut parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text(m.content.clone())
                .build()
                .map_err(build_error)?
                .into(),
        ];
        for img in &request.images {
            let part = ChatCompletionRequestMessageContentPartImageArgs::default()
                .image_url(
                    ImageUrlArgs::default()
                        .url(img.data_url())
                        .build()
                        .map_err(build_error)?,
                )
                .build()
                .map_err(build_error)?;
            parts.push(part.into());
        }
        Ok(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(parts)
                .build()
                .map_err(build_error)?,
        ))
    }

    fn build_request(&self, request: &LlmRequest) -> Result<CreateChatCompletionRequest, LlmError> {
        let base = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(request)?)
            .max_completion_tokens(self.max_tokens)
            .build()
            .map_err(build_error)?;

        let extras = request_extras(request);
        if extras.is_empty() {
            return Ok(base);
        }
        // 工具目录与结构化输出以线格式并入，再由 async-openai 的请求类型校验
        let mut body = serde_json::to_value(&base).map_err(build_error)?;
        if let Some(obj) = body.as_object_mut() {
            obj.extend(extras);
        }
        serde_json::from_value(body).map_err(build_error)
    }
}

/// tools / tool_choice / response_format 字段
fn request_extras(request: &LlmRequest) -> serde_json::Map<String, Value> {
    let mut extras = serde_json::Map::new();
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        extras.insert("tools".into(), Value::Array(tools));
        let choice = match &request.tool_choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Required(name) => json!({"type": "function", "function": {"name": name}}),
        };
        extras.insert("tool_choice".into(), choice);
    }
    if let Some(schema) = &request.response_schema {
        extras.insert(
            "response_format".into(),
            json!({
                "type": "json_schema",
                "json_schema": {"name": schema.name, "schema": schema.schema}
            }),
        );
    }
    extras
}

fn api_error(api: &ApiError) -> LlmError {
    let kind = api.r#type.clone().unwrap_or_default().to_lowercase();
    let message: String = api.message.chars().take(500).collect();
    let lower = message.to_lowercase();
    if kind.contains("auth") || lower.contains("api key") || lower.contains("unauthorized") {
        LlmError::Auth(message)
    } else if kind.contains("rate") || lower.contains("rate limit") {
        LlmError::RateLimited {
            retry_after_ms: None,
        }
    } else if kind.contains("server") || lower.contains("overloaded") {
        LlmError::Server {
            status: 500,
            message,
        }
    } else {
        LlmError::InvalidRequest(message)
    }
}

fn transport_error(err: &reqwest::Error) -> LlmError {
    if err.is_timeout() {
        return LlmError::Timeout;
    }
    match err.status() {
        Some(s) if s == reqwest::StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
            retry_after_ms: None,
        },
        Some(s) if s.is_server_error() => LlmError::Server {
            status: s.as_u16(),
            message: err.to_string(),
        },
        Some(s) if s == reqwest::StatusCode::UNAUTHORIZED || s == reqwest::StatusCode::FORBIDDEN => {
            LlmError::Auth(err.to_string())
        }
        _ => LlmError::Network(err.to_string()),
    }
}

fn map_openai_error(err: OpenAIError) -> LlmError {
    match &err {
        OpenAIError::Reqwest(e) => transport_error(e),
        OpenAIError::ApiError(api) => api_error(api),
        OpenAIError::JSONDeserialize(..) => LlmError::Decode(err.to_string()),
        _ => LlmError::InvalidRequest(err.to_string()),
    }
}

/// 解析首条 message：tool_calls 优先，其次 content；请求了 schema 时尝试解析为结构化对象
fn parse_message(message: &Value, expect_structured: bool) -> Result<LlmResponse, LlmError> {
    if let Some(call) = message
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .and_then(|t| t.first())
    {
        let function = call
            .get("function")
            .ok_or_else(|| LlmError::Decode("tool call without function".to_string()))?;
        let name = function
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| LlmError::Decode("tool call without name".to_string()))?;
        let arguments = match function.get("arguments") {
            Some(Value::String(s)) if s.trim().is_empty() => json!({}),
            Some(Value::String(s)) => serde_json::from_str(s)
                .map_err(|e| LlmError::Decode(format!("tool arguments are not JSON: {e}")))?,
            Some(v) => v.clone(),
            None => json!({}),
        };
        return Ok(LlmResponse::ToolCall(ToolInvocation {
            name: name.to_string(),
            arguments,
        }));
    }

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    if expect_structured {
        if let Ok(v) = serde_json::from_str::<Value>(content.trim()) {
            return Ok(LlmResponse::Structured(v));
        }
    }
    Ok(LlmResponse::Text(content))
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let body = self.build_request(request)?;
        tracing::debug!(
            purpose = ?request.purpose,
            model = %self.model,
            tools = request.tools.len(),
            images = request.images.len(),
            "sending chat completion"
        );

        let response = self
            .client
            .chat()
            .create(body)
            .await
            .map_err(map_openai_error)?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let choice = response
            .choices
            .first()
            .ok_or_else(|| LlmError::Decode("response has no choices".to_string()))?;
        let message =
            serde_json::to_value(&choice.message).map_err(|e| LlmError::Decode(e.to_string()))?;
        parse_message(&message, request.response_schema.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{ImageAttachment, RequestPurpose, ToolSpec};

    fn client() -> OpenAiClient {
        OpenAiClient::new(Some("http://localhost:9/v1/"), "gpt-test", "sk", Duration::from_secs(5), 256)
            .unwrap()
    }

    #[test]
    fn test_request_carries_tools_and_forced_choice() {
        let req = LlmRequest::new(RequestPurpose::ActionSelection, vec![Message::user("go")])
            .with_tools(vec![ToolSpec {
                name: "analyze_image".into(),
                description: "d".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }])
            .with_tool_choice(ToolChoice::Required("analyze_image".into()));
        let body = serde_json::to_value(client().build_request(&req).unwrap()).unwrap();
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["tools"][0]["function"]["name"], "analyze_image");
        assert_eq!(body["tool_choice"]["function"]["name"], "analyze_image");
    }

    #[test]
    fn test_request_inlines_images_on_last_user_message() {
        let req = LlmRequest::new(
            RequestPurpose::ImageAnalysis,
            vec![Message::system("s"), Message::user("look")],
        )
        .with_images(vec![ImageAttachment::png("AAAA")]);
        let body = serde_json::to_value(client().build_request(&req).unwrap()).unwrap();
        let parts = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_request_with_schema_sets_response_format() {
        let req = LlmRequest::new(RequestPurpose::TaskValidation, vec![Message::user("done?")])
            .with_schema("task_verdict", json!({"type": "object", "properties": {"done": {"type": "boolean"}}}));
        let body = serde_json::to_value(client().build_request(&req).unwrap()).unwrap();
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "task_verdict");
    }

    #[test]
    fn test_parse_tool_call_arguments_string() {
        let message = json!({"tool_calls": [{
            "function": {"name": "get_patient_data", "arguments": "{\"patient_id\":\"p1\"}"}
        }]});
        match parse_message(&message, false).unwrap() {
            LlmResponse::ToolCall(tc) => {
                assert_eq!(tc.name, "get_patient_data");
                assert_eq!(tc.arguments["patient_id"], "p1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_structured_content_decoded() {
        let message = json!({"content": "{\"done\": true}"});
        assert!(matches!(
            parse_message(&message, true).unwrap(),
            LlmResponse::Structured(v) if v["done"] == true
        ));
        assert!(matches!(parse_message(&message, false).unwrap(), LlmResponse::Text(_)));
    }
}
