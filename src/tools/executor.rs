//! 工具执行器
//!
//! 持有共享的 ToolRegistry，execute(tool_name, args) 经注册表校验并执行；
//! 每次调用输出结构化审计日志（JSON）。不对单次调用施加超时，挂起的工具属于工具自身缺陷。

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::core::ToolError;
use crate::tools::{Tool, ToolRegistry};

/// 工具执行器：执行并记录审计日志；错误原样返回，由编排循环写回证据
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub async fn execute(&self, tool_name: &str, args: Value) -> Result<Value, ToolError> {
        let start = Instant::now();
        let preview = args_preview(&args);
        let result = self.registry.execute(tool_name, args).await;

        let (ok, outcome) = match &result {
            Ok(_) => (true, "ok"),
            Err(e) => (false, e.kind.as_str()),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");
        result
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
