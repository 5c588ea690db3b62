//! 证据日志：ToolOutput 与两条并行日志（已完成任务 / 进行中任务）
//!
//! 任务 N 产生的输出在任务 N+1 及之后始终可读；结束任务时整体移入 task_outputs。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ToolError;

/// 一次拟执行的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub tool_name: String,
    pub arguments: Value,
}

impl Action {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// 一次工具执行的不可变记录；失败时 result 为 Null 且 error 非空
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub task_id: usize,
    pub tool_name: String,
    pub arguments: Value,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub timestamp: DateTime<Utc>,
    pub sequence_index: usize,
}

impl ToolOutput {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// 结果正文（发送给推理服务的部分）
    pub fn body(&self) -> String {
        match &self.error {
            Some(e) => format!("ERROR {e}"),
            None => match &self.result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct EvidenceLog {
    task_outputs: Vec<ToolOutput>,
    task_step_outputs: Vec<ToolOutput>,
    next_index: usize,
}

impl EvidenceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        task_id: usize,
        action: &Action,
        outcome: Result<Value, ToolError>,
    ) -> &ToolOutput {
        let (result, error) = match outcome {
            Ok(v) => (v, None),
            Err(e) => (Value::Null, Some(e)),
        };
        self.task_step_outputs.push(ToolOutput {
            task_id,
            tool_name: action.tool_name.clone(),
            arguments: action.arguments.clone(),
            result,
            error,
            timestamp: Utc::now(),
            sequence_index: self.next_index,
        });
        self.next_index += 1;
        &self.task_step_outputs[self.task_step_outputs.len() - 1]
    }

    /// 当前任务结束：进行中日志并入会话日志
    pub fn close_task(&mut self) {
        self.task_outputs.append(&mut self.task_step_outputs);
    }

    pub fn task_outputs(&self) -> &[ToolOutput] {
        &self.task_outputs
    }

    pub fn current_step_outputs(&self) -> &[ToolOutput] {
        &self.task_step_outputs
    }

    /// 全部输出（按 sequence_index 顺序）
    pub fn all(&self) -> Vec<&ToolOutput> {
        self.task_outputs.iter().chain(self.task_step_outputs.iter()).collect()
    }

    pub fn len(&self) -> usize {
        self.task_outputs.len() + self.task_step_outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 最近一次成功输出中的字符串字段（如 patient_id），用于参数补全
    pub fn latest_string_field(&self, key: &str) -> Option<String> {
        self.all()
            .into_iter()
            .rev()
            .filter(|o| !o.is_error())
            .find_map(|o| find_string(&o.result, key).or_else(|| find_string(&o.arguments, key)))
    }
}

fn find_string(v: &Value, key: &str) -> Option<String> {
    match v {
        Value::Object(map) => {
            if let Some(Value::String(s)) = map.get(key) {
                if !s.trim().is_empty() {
                    return Some(s.clone());
                }
            }
            map.values().find_map(|child| find_string(child, key))
        }
        Value::Array(items) => items.iter().find_map(|child| find_string(child, key)),
        _ => None,
    }
}
