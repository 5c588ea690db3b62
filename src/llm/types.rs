//! 推理服务请求 / 响应类型
//!
//! 请求 = 有序消息历史 + 可选工具目录 + 可选结构化输出 schema + 可选内联图片；
//! 响应 = 纯文本 / 工具调用指令 / 结构化对象 三选一。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 内联图片（base64），随最后一条 user 消息发送
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageAttachment {
    pub media_type: String,
    pub data_base64: String,
}

impl ImageAttachment {
    pub fn png(data_base64: impl Into<String>) -> Self {
        Self {
            media_type: "image/png".to_string(),
            data_base64: data_base64.into(),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data_base64)
    }
}

/// 暴露给推理服务的可调用工具
#[derive(Clone, Debug, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 结构化输出 schema（Planner / Validator 用于避免自由文本解析）
#[derive(Clone, Debug)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: Value,
}

/// 请求用途：用于日志、事件与 Mock 路由
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPurpose {
    Planning,
    ActionSelection,
    TaskValidation,
    SessionValidation,
    Synthesis,
    ImageAnalysis,
}

/// 工具目录中的强制选择
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    /// 强制调用指定工具（用于点名的专科远程分析工具）
    Required(String),
}

/// 一次完整的推理请求
#[derive(Clone, Debug)]
pub struct LlmRequest {
    pub purpose: RequestPurpose,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoice,
    pub response_schema: Option<ResponseSchema>,
    pub images: Vec<ImageAttachment>,
}

impl LlmRequest {
    pub fn new(purpose: RequestPurpose, messages: Vec<Message>) -> Self {
        Self {
            purpose,
            messages,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            response_schema: None,
            images: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn with_schema(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.response_schema = Some(ResponseSchema {
            name: name.into(),
            schema,
        });
        self
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = images;
        self
    }

    /// 所有消息的字符总数（用于事件中的请求规模）
    pub fn content_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

/// 推理服务给出的工具调用指令
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// 推理服务响应
#[derive(Clone, Debug, PartialEq)]
pub enum LlmResponse {
    Text(String),
    ToolCall(ToolInvocation),
    Structured(Value),
}

impl LlmResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            LlmResponse::Text(_) => "text",
            LlmResponse::ToolCall(_) => "tool_call",
            LlmResponse::Structured(_) => "structured",
        }
    }

    /// 取文本内容；结构化对象序列化为 JSON 字符串
    pub fn into_text(self) -> String {
        match self {
            LlmResponse::Text(t) => t,
            LlmResponse::ToolCall(tc) => format!("{} {}", tc.name, tc.arguments),
            LlmResponse::Structured(v) => v.to_string(),
        }
    }
}

/// 从文本中提取 JSON 对象（```json ... ``` 或裸 JSON），用于未按 schema 返回结构化对象的后端
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let candidate = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        if end < start {
            return None;
        }
        &trimmed[start..=end]
    };
    serde_json::from_str(candidate).ok()
}
