//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册。
//! 注册时编译参数 schema 并拒绝重名，执行时先做 schema 校验；未注册的名字返回 unknown_tool，从不静默兜底。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::Validator;
use serde_json::Value;

use crate::core::{AgentError, ToolError};
use crate::llm::ToolSpec;
use crate::tools::schema;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（推理服务以此字符串指名调用）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        schema::empty_object_schema()
    }

    /// 探索型工具：采样原始数据结构，调用后才允许接受"空结果"
    fn is_discovery(&self) -> bool {
        false
    }

    /// 专科远程分析工具：任务点名时强制选择
    fn is_specialist(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError>;
}

struct Registered {
    tool: Arc<dyn Tool>,
    schema: Value,
    validator: Validator,
}

/// 工具注册表：名称 → (工具, 编译后的参数校验器)；按名称有序，保证目录顺序稳定
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Registered>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；重名或 schema 无法编译时返回 RegistryError
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), AgentError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let name = tool.name().to_string();
        if name.trim().is_empty() {
            return Err(AgentError::RegistryError("tool name must not be empty".into()));
        }
        if self.tools.contains_key(&name) {
            return Err(AgentError::RegistryError(format!("duplicate tool name: {name}")));
        }
        let schema = tool.parameters_schema();
        let validator = schema::compile(&schema)
            .map_err(|e| AgentError::RegistryError(format!("invalid schema for {name}: {e}")))?;
        tracing::debug!(tool = %name, "registered tool");
        self.tools.insert(
            name,
            Registered {
                tool,
                schema,
                validator,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| r.tool.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn schema_of(&self, name: &str) -> Option<&Value> {
        self.tools.get(name).map(|r| &r.schema)
    }

    pub fn is_discovery(&self, name: &str) -> bool {
        self.tools.get(name).map(|r| r.tool.is_discovery()).unwrap_or(false)
    }

    pub fn is_specialist(&self, name: &str) -> bool {
        self.tools.get(name).map(|r| r.tool.is_specialist()).unwrap_or(false)
    }

    /// 校验参数是否符合工具声明的 schema
    pub fn validate(&self, name: &str, args: &Value) -> Result<(), ToolError> {
        let reg = self.tools.get(name).ok_or_else(|| ToolError::unknown_tool(name))?;
        schema::validate_arguments(&reg.validator, args)
    }

    /// 校验后执行
    pub async fn execute(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let reg = self.tools.get(name).ok_or_else(|| ToolError::unknown_tool(name))?;
        let args = if args.is_null() { Value::Object(Default::default()) } else { args };
        schema::validate_arguments(&reg.validator, &args)?;
        reg.tool.execute(args).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn discovery_tools(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter(|(_, r)| r.tool.is_discovery())
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn specialist_tools(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter(|(_, r)| r.tool.is_specialist())
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// 工具目录（供 Action Selector 暴露为可调用 schema）
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|(name, r)| ToolSpec {
                name: name.clone(),
                description: r.tool.description().to_string(),
                parameters: r.schema.clone(),
            })
            .collect()
    }

    /// 返回 (name, description) 列表，用于生成 prompt 中的 Available tools 段落
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .map(|(name, r)| (name.clone(), r.tool.description().to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolErrorKind;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo text"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }
        async fn execute(&self, args: Value) -> Result<Value, ToolError> {
            Ok(args["text"].clone())
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut reg = ToolRegistry::new();
        reg.register(Echo).unwrap();
        assert!(matches!(reg.register(Echo), Err(AgentError::RegistryError(_))));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_tool_error() {
        let reg = ToolRegistry::new();
        let err = reg.execute("nope", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::UnknownTool);
        assert_eq!(err.message, "Unknown tool: nope");
    }

    #[tokio::test]
    async fn test_schema_violation_blocks_execution() {
        let mut reg = ToolRegistry::new();
        reg.register(Echo).unwrap();
        let err = reg.execute("echo", json!({"text": 3})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidArguments);
        assert_eq!(reg.execute("echo", json!({"text": "hi"})).await.unwrap(), json!("hi"));
    }

    #[test]
    fn test_specs_expose_schema() {
        let mut reg = ToolRegistry::new();
        reg.register(Echo).unwrap();
        let specs = reg.specs();
        assert_eq!(specs[0].name, "echo");
        assert_eq!(specs[0].parameters["required"][0], "text");
    }
}
