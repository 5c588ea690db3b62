//! Validator：判断当前任务 / 整个会话是否已得到充分回答
//!
//! 任务级判定在调用推理服务之前先执行确定性规则：
//! 1. 最后一次输出是工具错误：未完成（tool_error），把错误回灌给 Action Selector
//! 2. 最后一次输出为空、本任务未调用过探索型工具、任务本身也不是"确认不存在"：未完成（needs_discovery）
//! 3. 其余情况交给推理服务做结构化判定 {done, reason}

use std::sync::{Arc, OnceLock};

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{AgentError, Task};
use crate::llm::{LlmClient, LlmRequest, Message, RequestPurpose};
use crate::react::events::Transcript;
use crate::react::evidence::EvidenceLog;
use crate::react::{prompts, reasoning};
use crate::tools::schema::schema_value;
use crate::tools::ToolRegistry;

pub const NEEDS_DISCOVERY: &str = "needs_discovery";
pub const TOOL_ERROR: &str = "tool_error";

/// 任务本身要求确认"不存在"时，空结果属于预期
///
/// 只匹配指向否定的措辞（confirm no / rule out / absence of / check whether ... not），
/// "verify" 或 "check" 本身不构成豁免。
fn absence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(rul(e|es|ed|ing)\s+out|absence\s+of|absent|(confirm|verify|ensure|check)\s+(that\s+)?(there\s+(is|are)\s+)?(no|none)\b|(confirm|verify|check)\s+(if|whether)\b.*\b(not|no|none|never)\b)",
        )
        .unwrap()
    })
}

/// 任务级判定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Verdict {
    pub done: bool,
    #[serde(default)]
    pub reason: String,
}

/// 会话级判定；missing 为补救任务描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SessionVerdict {
    pub answered: bool,
    #[serde(default)]
    pub missing: Option<String>,
}

/// 任务判定结果 + 回灌给下一轮选择的提示
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCheck {
    pub verdict: Verdict,
    pub hint: Option<String>,
}

impl TaskCheck {
    fn done(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict {
                done: true,
                reason: reason.into(),
            },
            hint: None,
        }
    }

    fn not_done(reason: &str, hint: String) -> Self {
        Self {
            verdict: Verdict {
                done: false,
                reason: reason.to_string(),
            },
            hint: Some(hint),
        }
    }
}

/// 空结果判定：null、空串、空数组、空对象、count/total 为 0、所有数组字段为空的对象
///
/// 显式的非零 count/total 优先于空数组（如 limit=0 时只返回计数）。
pub fn is_empty_result(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => {
            if map.is_empty() {
                return true;
            }
            let counts: Vec<u64> = ["count", "total"]
                .iter()
                .filter_map(|k| map.get(*k).and_then(Value::as_u64))
                .collect();
            if !counts.is_empty() {
                return counts.iter().all(|&c| c == 0);
            }
            let arrays: Vec<&Vec<Value>> = map.values().filter_map(Value::as_array).collect();
            !arrays.is_empty() && arrays.iter().all(|a| a.is_empty())
        }
        _ => false,
    }
}

pub fn asks_to_confirm_absence(description: &str) -> bool {
    absence_re().is_match(description)
}

pub struct Validator {
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
}

impl Validator {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>) -> Self {
        Self { llm, registry }
    }

    /// 不调用推理服务的规则判定；None 表示需要推理服务判定
    pub fn precheck(&self, task: &Task, log: &EvidenceLog) -> Option<TaskCheck> {
        let outputs = log.current_step_outputs();
        let last = outputs.last()?;

        if let Some(err) = &last.error {
            return Some(TaskCheck::not_done(
                TOOL_ERROR,
                format!(
                    "The last call to {} failed ({}: {}). Correct the arguments or choose another tool.",
                    last.tool_name,
                    err.kind.as_str(),
                    err.message
                ),
            ));
        }

        if is_empty_result(&last.result) {
            let discovery = self.registry.discovery_tools();
            let investigated = outputs
                .iter()
                .any(|o| self.registry.is_discovery(&o.tool_name));
            if !investigated && !discovery.is_empty() && !asks_to_confirm_absence(&task.description) {
                tracing::info!(task = task.id, tool = %last.tool_name, "empty result before discovery");
                return Some(TaskCheck::not_done(
                    NEEDS_DISCOVERY,
                    format!(
                        "{} returned no data. Before concluding nothing exists, call a discovery tool ({}) to learn how the data is actually structured and encoded, then retry with matching values.",
                        last.tool_name,
                        discovery.join(", ")
                    ),
                ));
            }
        }
        None
    }

    pub async fn validate_task(
        &self,
        query: &str,
        task: &Task,
        log: &EvidenceLog,
        evidence: &str,
        transcript: &mut Transcript,
    ) -> Result<TaskCheck, AgentError> {
        if let Some(check) = self.precheck(task, log) {
            return Ok(check);
        }
        let request = LlmRequest::new(
            RequestPurpose::TaskValidation,
            vec![
                Message::system(prompts::TASK_VALIDATION_SYSTEM),
                Message::user(format!(
                    "Original query:\n{query}\n\nCurrent task [{}]: {}\n\nEvidence:\n{evidence}",
                    task.id, task.description
                )),
            ],
        )
        .with_schema("task_verdict", schema_value::<Verdict>());
        let verdict: Verdict =
            reasoning::complete_structured(self.llm.as_ref(), &request, transcript).await?;
        if verdict.done {
            return Ok(TaskCheck::done(verdict.reason));
        }
        let hint = if verdict.reason.trim().is_empty() {
            "The task is not complete yet.".to_string()
        } else {
            format!("The task is not complete yet: {}", verdict.reason)
        };
        Ok(TaskCheck {
            verdict,
            hint: Some(hint),
        })
    }

    pub async fn validate_session(
        &self,
        query: &str,
        evidence: &str,
        transcript: &mut Transcript,
    ) -> Result<SessionVerdict, AgentError> {
        let request = LlmRequest::new(
            RequestPurpose::SessionValidation,
            vec![
                Message::system(prompts::SESSION_VALIDATION_SYSTEM),
                Message::user(format!("Original query:\n{query}\n\nEvidence:\n{evidence}")),
            ],
        )
        .with_schema("session_verdict", schema_value::<SessionVerdict>());
        let mut verdict: SessionVerdict =
            reasoning::complete_structured(self.llm.as_ref(), &request, transcript).await?;
        if verdict
            .missing
            .as_deref()
            .map(|m| m.trim().is_empty())
            .unwrap_or(false)
        {
            verdict.missing = None;
        }
        Ok(verdict)
    }
}
