//! Action Selector：为当前任务选择下一次工具调用
//!
//! 每次选择只发起一次推理调用，工具目录以可调用 schema 形式暴露。
//! 返回的参数会经过补全：schema 默认值、从已有证据中串联必填标识（如 patient_id）、
//! 从任务描述中推断枚举值。任务描述点名了专科工具且本任务尚未调用时，强制选择该工具。

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::{AgentError, Task};
use crate::llm::{LlmClient, LlmRequest, LlmResponse, Message, RequestPurpose, ToolChoice};
use crate::react::events::Transcript;
use crate::react::evidence::{Action, EvidenceLog};
use crate::react::loop_guard::ActionWindow;
use crate::react::{prompts, reasoning};
use crate::tools::schema;
use crate::tools::ToolRegistry;

/// 一次选择的结果：要执行的动作，或推理服务认为当前任务已无需再调用工具
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Action(Action),
    NoAction(String),
}

/// 选择所需的只读上下文
pub struct SelectionContext<'a> {
    pub query: &'a str,
    pub task: &'a Task,
    /// 已经经过 Context Manager 渲染的证据文本
    pub evidence: &'a str,
    pub log: &'a EvidenceLog,
    pub recent: &'a ActionWindow,
    pub hints: &'a [String],
}

pub struct ActionSelector {
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
}

impl ActionSelector {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>) -> Self {
        Self { llm, registry }
    }

    /// 任务描述中点名、且本任务尚未调用过的专科工具
    pub fn forced_specialist(&self, task: &Task, log: &EvidenceLog) -> Option<String> {
        let description = task.description.to_lowercase();
        self.registry.specialist_tools().into_iter().find(|name| {
            description.contains(&name.to_lowercase())
                && !log
                    .current_step_outputs()
                    .iter()
                    .any(|o| &o.tool_name == name)
        })
    }

    pub async fn select(
        &self,
        ctx: &SelectionContext<'_>,
        transcript: &mut Transcript,
    ) -> Result<Selection, AgentError> {
        let forced = self.forced_specialist(ctx.task, ctx.log);
        let mut request = LlmRequest::new(
            RequestPurpose::ActionSelection,
            vec![
                Message::system(prompts::ACTION_SYSTEM),
                Message::user(render_prompt(ctx)),
            ],
        )
        .with_tools(self.registry.specs());
        if let Some(name) = &forced {
            tracing::debug!(tool = %name, task = ctx.task.id, "forcing specialist tool");
            request = request.with_tool_choice(ToolChoice::Required(name.clone()));
        }

        let response = reasoning::complete(self.llm.as_ref(), &request, transcript).await?;
        let proposed = match response {
            LlmResponse::ToolCall(tc) => Some(Action::new(tc.name, tc.arguments)),
            LlmResponse::Structured(v) => structured_action(&v),
            LlmResponse::Text(text) => {
                if forced.is_none() {
                    return Ok(Selection::NoAction(text));
                }
                None
            }
        };

        let action = match (forced, proposed) {
            (Some(name), Some(a)) if a.tool_name == name => a,
            (Some(name), _) => Action::new(name, Value::Object(Map::new())),
            (None, Some(a)) => a,
            (None, None) => return Ok(Selection::NoAction(String::new())),
        };
        Ok(Selection::Action(refine_arguments(
            &self.registry,
            ctx.log,
            ctx.task,
            action,
        )))
    }
}

fn structured_action(v: &Value) -> Option<Action> {
    let name = v.get("name").or_else(|| v.get("tool")).and_then(Value::as_str)?;
    let arguments = v
        .get("arguments")
        .or_else(|| v.get("args"))
        .cloned()
        .unwrap_or(Value::Null);
    Some(Action::new(name, arguments))
}

fn render_prompt(ctx: &SelectionContext<'_>) -> String {
    let mut out = format!(
        "Original query:\n{}\n\nCurrent task [{}]: {}\n\n",
        ctx.query, ctx.task.id, ctx.task.description
    );
    if ctx.evidence.trim().is_empty() {
        out.push_str("Evidence so far: none\n");
    } else {
        out.push_str("Evidence so far:\n");
        out.push_str(ctx.evidence);
    }
    if !ctx.recent.is_empty() {
        out.push_str("\nRecent actions:\n");
        for a in ctx.recent.iter() {
            out.push_str(&format!("- {} {}\n", a.tool_name, a.arguments));
        }
    }
    for hint in ctx.hints {
        out.push_str(&format!("\nNOTE: {hint}\n"));
    }
    out
}

/// 参数补全（仅针对已注册工具；未注册名字原样交给注册表报 unknown_tool）
///
/// 作用于推理服务提议的动作，在重复检测与工具调用之前执行，
/// 因此 Loop Guard 与证据日志看到的都是补全后的参数。
pub fn refine_arguments(
    registry: &ToolRegistry,
    log: &EvidenceLog,
    task: &Task,
    mut action: Action,
) -> Action {
    let Some(schema) = registry.schema_of(&action.tool_name) else {
        return action;
    };
    schema::fill_defaults(schema, &mut action.arguments);
    let Some(args) = action.arguments.as_object_mut() else {
        return action;
    };

    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let description = task.description.to_lowercase();

    for name in required {
        let present = args
            .get(name)
            .map(|v| !v.is_null() && v.as_str().map(|s| !s.trim().is_empty()).unwrap_or(true))
            .unwrap_or(false);
        if present {
            continue;
        }
        let Some(prop) = property_schema(schema, name) else {
            continue;
        };
        if let Some(choices) = prop.get("enum").and_then(Value::as_array) {
            let compact = description.replace(['-', ' '], "");
            if let Some(choice) = choices
                .iter()
                .filter_map(Value::as_str)
                .find(|c| description.contains(c) || compact.contains(c))
            {
                args.insert(name.to_string(), Value::String(choice.to_string()));
            }
            continue;
        }
        let is_string = prop
            .get("type")
            .map(|t| t == "string" || t.as_array().map(|a| a.iter().any(|x| x == "string")).unwrap_or(false))
            .unwrap_or(false);
        if is_string {
            if let Some(found) = log.latest_string_field(name) {
                tracing::debug!(tool = %action.tool_name, arg = name, value = %found, "argument threaded from evidence");
                args.insert(name.to_string(), Value::String(found));
            }
        }
    }
    action
}

/// 取顶层属性 schema，解析本地 $ref（schemars 把枚举放在 definitions 中）
fn property_schema<'a>(schema: &'a Value, name: &str) -> Option<&'a Value> {
    let prop = schema.get("properties")?.get(name)?;
    let reference = prop
        .get("$ref")
        .or_else(|| prop.get("allOf").and_then(|a| a.get(0)).and_then(|x| x.get("$ref")))
        .and_then(Value::as_str);
    match reference {
        Some(r) => {
            let key = r.rsplit('/').next()?;
            schema
                .get("definitions")
                .or_else(|| schema.get("$defs"))
                .and_then(|d| d.get(key))
        }
        None => Some(prop),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolError;
    use crate::llm::MockLlmClient;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    struct Lookup;

    #[async_trait]
    impl Tool for Lookup {
        fn name(&self) -> &str {
            "lookup"
        }
        fn description(&self) -> &str {
            "Look up a patient"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "patient_id": {"type": "string"},
                    "kind": {"$ref": "#/definitions/Kind"},
                    "limit": {"type": "integer", "default": 50}
                },
                "required": ["patient_id", "kind"],
                "definitions": {"Kind": {"type": "string", "enum": ["ecg", "xray"]}}
            })
        }
        async fn execute(&self, args: Value) -> Result<Value, ToolError> {
            Ok(args)
        }
    }

    struct Scanner;

    #[async_trait]
    impl Tool for Scanner {
        fn name(&self) -> &str {
            "analyze_image"
        }
        fn description(&self) -> &str {
            "Remote image analysis"
        }
        fn is_specialist(&self) -> bool {
            true
        }
        async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
            Ok(json!({"analysis": "ok"}))
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut r = ToolRegistry::new();
        r.register(Lookup).unwrap();
        r.register(Scanner).unwrap();
        Arc::new(r)
    }

    #[test]
    fn test_refine_threads_patient_id_and_infers_enum() {
        let reg = registry();
        let mut log = EvidenceLog::new();
        log.record(1, &Action::new("search", json!({})), Ok(json!({"matches": [{"patient_id": "p42"}]})));
        log.close_task();
        let task = Task::new(2, "Review the ECG for that patient");
        let refined = refine_arguments(&reg, &log, &task, Action::new("lookup", Value::Null));
        assert_eq!(refined.arguments, json!({"patient_id": "p42", "kind": "ecg", "limit": 50}));
    }

    #[test]
    fn test_refine_keeps_explicit_arguments() {
        let reg = registry();
        let log = EvidenceLog::new();
        let task = Task::new(1, "x-ray review");
        let refined = refine_arguments(
            &reg,
            &log,
            &task,
            Action::new("lookup", json!({"patient_id": "p1", "limit": 3})),
        );
        assert_eq!(refined.arguments, json!({"patient_id": "p1", "kind": "xray", "limit": 3}));
        let unknown = refine_arguments(&reg, &log, &task, Action::new("nope", json!(null)));
        assert_eq!(unknown.arguments, Value::Null);
    }

    #[tokio::test]
    async fn test_specialist_forced_when_named_in_task() {
        let mock = Arc::new(MockLlmClient::new().with(
            RequestPurpose::ActionSelection,
            LlmResponse::ToolCall(crate::llm::ToolInvocation {
                name: "lookup".into(),
                arguments: json!({"patient_id": "p1", "kind": "ecg"}),
            }),
        ));
        let selector = ActionSelector::new(mock.clone(), registry());
        let log = EvidenceLog::new();
        let recent = ActionWindow::new();
        let task = Task::new(1, "Interpret the ECG with analyze_image");
        let ctx = SelectionContext {
            query: "q",
            task: &task,
            evidence: "",
            log: &log,
            recent: &recent,
            hints: &[],
        };
        let mut t = Transcript::new(Uuid::new_v4(), vec![]);
        let sel = selector.select(&ctx, &mut t).await.unwrap();
        assert_eq!(sel, Selection::Action(Action::new("analyze_image", json!({}))));
        let req = &mock.requests()[0];
        assert_eq!(req.tool_choice, ToolChoice::Required("analyze_image".into()));
    }

    #[tokio::test]
    async fn test_specialist_not_forced_after_it_ran() {
        let selector = ActionSelector::new(Arc::new(MockLlmClient::new()), registry());
        let mut log = EvidenceLog::new();
        log.record(1, &Action::new("analyze_image", json!({})), Ok(json!({"analysis": "ok"})));
        let task = Task::new(1, "Interpret the ECG with analyze_image");
        assert_eq!(selector.forced_specialist(&task, &log), None);

        let recent = ActionWindow::new();
        let ctx = SelectionContext {
            query: "q",
            task: &task,
            evidence: "",
            log: &log,
            recent: &recent,
            hints: &[],
        };
        let mut t = Transcript::new(Uuid::new_v4(), vec![]);
        let sel = selector.select(&ctx, &mut t).await.unwrap();
        assert!(matches!(sel, Selection::NoAction(_)));
    }
}
