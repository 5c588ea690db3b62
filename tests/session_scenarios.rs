//! 端到端会话测试：MockLlmClient 脚本化推理 + 测试内工具

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use medster::config::AppConfig;
use medster::core::{AbortReason, AgentBuilder, Phase, TaskStatus, ToolError};
use medster::llm::{LlmResponse, MockLlmClient, RequestPurpose};
use medster::react::{ChannelSink, EventKind};
use medster::tools::{Tool, ToolRegistry};
use serde_json::{json, Value};

struct ListItems;

#[async_trait]
impl Tool for ListItems {
    fn name(&self) -> &str {
        "list_items"
    }
    fn description(&self) -> &str {
        "List items from a source"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"source": {"type": "string"}, "limit": {"type": "integer"}},
            "required": ["source"]
        })
    }
    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        Ok(json!(["a", "b", "c"]))
    }
}

struct LabLookup;

#[async_trait]
impl Tool for LabLookup {
    fn name(&self) -> &str {
        "lab_lookup"
    }
    fn description(&self) -> &str {
        "Latest HbA1c for a patient"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"patient_id": {"type": "string"}},
            "required": ["patient_id"]
        })
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        Ok(json!({"patient_id": args["patient_id"], "hba1c": 7.2, "unit": "%"}))
    }
}

struct Step;

#[async_trait]
impl Tool for Step {
    fn name(&self) -> &str {
        "step"
    }
    fn description(&self) -> &str {
        "One partial step of a longer computation"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"n": {"type": "integer"}}, "required": ["n"]})
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        Ok(json!({"completed_step": args["n"]}))
    }
}

/// 只认识 ICD 编码的检索工具：用自然语言名称检索总是为空
struct CodeSearch;

#[async_trait]
impl Tool for CodeSearch {
    fn name(&self) -> &str {
        "search_records"
    }
    fn description(&self) -> &str {
        "Search patients by condition code"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"code": {"type": "string"}}, "required": ["code"]})
    }
    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        if args["code"] == "I48" {
            Ok(json!({"count": 1, "patient_ids": ["p7"]}))
        } else {
            Ok(json!({"count": 0, "patient_ids": []}))
        }
    }
}

struct Sampler;

#[async_trait]
impl Tool for Sampler {
    fn name(&self) -> &str {
        "sample_records"
    }
    fn description(&self) -> &str {
        "Sample raw records to learn field conventions"
    }
    fn is_discovery(&self) -> bool {
        true
    }
    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        Ok(json!({"samples": [{"condition": {"code": "I48", "display": "Atrial fibrillation"}}]}))
    }
}

/// 执行耗时的工具，用于在调用进行中触发取消
struct SlowStep;

#[async_trait]
impl Tool for SlowStep {
    fn name(&self) -> &str {
        "slow_step"
    }
    fn description(&self) -> &str {
        "A step that takes a while"
    }
    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!({"done": "partially"}))
    }
}

fn registry(tools: Vec<Arc<dyn Tool>>) -> ToolRegistry {
    let mut r = ToolRegistry::new();
    for t in tools {
        r.register_arc(t).unwrap();
    }
    r
}

fn config(max_steps: usize, per_task: usize) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.agent.max_steps = max_steps;
    cfg.agent.max_steps_per_task = per_task;
    cfg
}

fn not_done(reason: &str) -> LlmResponse {
    LlmResponse::Structured(json!({"done": false, "reason": reason}))
}

#[tokio::test]
async fn test_list_three_items_in_one_task() {
    let mock = Arc::new(MockLlmClient::new().with_tool_call("list_items", json!({"source": "X", "limit": 3})));
    let agent = AgentBuilder::new(AppConfig::default())
        .with_llm(mock)
        .with_registry(registry(vec![Arc::new(ListItems)]))
        .build()
        .unwrap();

    let out = agent.run("list 3 items from source X").await;
    assert_eq!(out.tasks.len(), 1);
    assert!(out.steps <= 2);
    assert!(!out.partial);
    for item in ["\"a\"", "\"b\"", "\"c\""] {
        assert!(out.answer.contains(item), "missing {item} in {}", out.answer);
    }
    assert_eq!(out.phases.last(), Some(&Phase::Done));
}

#[tokio::test]
async fn test_invalid_arguments_recovered_on_next_step() {
    let mock = Arc::new(
        MockLlmClient::new()
            .with_tool_call("lab_lookup", json!({"patient": "p1"}))
            .with_tool_call("lab_lookup", json!({"patient_id": "p1"})),
    );
    let agent = AgentBuilder::new(AppConfig::default())
        .with_llm(mock.clone())
        .with_registry(registry(vec![Arc::new(LabLookup)]))
        .build()
        .unwrap();

    let out = agent.run("Latest HbA1c for p1").await;
    assert!(out.abort.is_none());
    assert!(!out.partial);
    assert_eq!(out.tasks[0].status, TaskStatus::Done);

    let results: Vec<&Value> = out
        .transcript
        .iter()
        .filter(|e| e.kind == EventKind::ToolResult)
        .map(|e| &e.payload)
        .collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["ok"], false);
    assert_eq!(results[0]["error"]["kind"], "invalid_arguments");
    assert_eq!(results[1]["ok"], true);

    // 第二次选择时错误已作为证据回灌
    let selections: Vec<_> = mock
        .requests()
        .into_iter()
        .filter(|r| r.purpose == RequestPurpose::ActionSelection)
        .collect();
    assert!(selections[1].messages[1].content.contains("invalid_arguments"));
}

#[tokio::test]
async fn test_global_budget_exhaustion_yields_partial_answer() {
    let mock = Arc::new(
        MockLlmClient::new()
            .with_tool_call("step", json!({"n": 1}))
            .with_tool_call("step", json!({"n": 2}))
            .with_tool_call("step", json!({"n": 3}))
            .with(RequestPurpose::TaskValidation, not_done("two more steps needed"))
            .with(RequestPurpose::TaskValidation, not_done("one more step needed")),
    );
    let agent = AgentBuilder::new(config(2, 5))
        .with_llm(mock)
        .with_registry(registry(vec![Arc::new(Step)]))
        .build()
        .unwrap();

    let out = agent.run("Run the three-step computation").await;
    assert_eq!(out.steps, 2);
    assert_eq!(out.abort, Some(AbortReason::BudgetExceeded));
    assert!(out.phases.contains(&Phase::Aborted));
    assert!(out.partial);
    assert!(out.answer.starts_with("[Partial answer: global step budget exhausted]"));
    assert!(out.answer.len() > "[Partial answer: global step budget exhausted]".len());
}

#[tokio::test]
async fn test_step_counters_never_exceed_budgets() {
    let mock = Arc::new(MockLlmClient::new().with(
        RequestPurpose::Planning,
        LlmResponse::Structured(json!({"tasks": [
            {"id": 1, "description": "first part"},
            {"id": 2, "description": "second part"},
            {"id": 3, "description": "third part"}
        ]})),
    ));
    for n in 0..12 {
        mock.push(
            RequestPurpose::ActionSelection,
            Ok(LlmResponse::ToolCall(medster::llm::ToolInvocation {
                name: "step".into(),
                arguments: json!({"n": n}),
            })),
        );
        mock.push(RequestPurpose::TaskValidation, Ok(not_done("keep going")));
    }
    let agent = AgentBuilder::new(config(7, 3))
        .with_llm(mock)
        .with_registry(registry(vec![Arc::new(Step)]))
        .build()
        .unwrap();

    let out = agent.run("three part job").await;
    assert_eq!(out.steps, 7);

    let mut per_task: HashMap<u64, usize> = HashMap::new();
    for e in out.transcript.iter().filter(|e| e.kind == EventKind::ToolCall) {
        *per_task.entry(e.payload["task_id"].as_u64().unwrap()).or_default() += 1;
    }
    assert!(per_task.values().all(|&c| c <= 3), "{per_task:?}");
    assert!(per_task.values().sum::<usize>() <= 7);
    assert_eq!(out.tasks[0].status, TaskStatus::Abandoned);
    assert_eq!(out.tasks[1].status, TaskStatus::Abandoned);
    assert_eq!(out.abort, Some(AbortReason::BudgetExceeded));
}

#[tokio::test]
async fn test_empty_result_triggers_discovery_round() {
    let mock = Arc::new(
        MockLlmClient::new()
            .with_tool_call("search_records", json!({"code": "atrial fibrillation"}))
            .with_tool_call("sample_records", json!({}))
            .with_tool_call("search_records", json!({"code": "I48"}))
            .with(RequestPurpose::TaskValidation, not_done("retry the search with the discovered code")),
    );
    let agent = AgentBuilder::new(AppConfig::default())
        .with_llm(mock.clone())
        .with_registry(registry(vec![Arc::new(CodeSearch), Arc::new(Sampler)]))
        .build()
        .unwrap();

    let out = agent.run("Which patients have atrial fibrillation?").await;
    assert_eq!(out.steps, 3);
    assert_eq!(out.tasks[0].status, TaskStatus::Done);
    assert!(!out.partial);

    // 首次空结果由规则判定，不调用推理服务
    assert_eq!(mock.calls_for(RequestPurpose::TaskValidation), 2);
    let selections: Vec<_> = mock
        .requests()
        .into_iter()
        .filter(|r| r.purpose == RequestPurpose::ActionSelection)
        .collect();
    assert!(selections[1].messages[1].content.contains("discovery tool (sample_records)"));
    assert!(out.answer.contains("p7"));
}

#[tokio::test]
async fn test_channel_sink_receives_ordered_events() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mock = Arc::new(MockLlmClient::new().with_tool_call("list_items", json!({"source": "X"})));
    let agent = AgentBuilder::new(AppConfig::default())
        .with_llm(mock)
        .with_registry(registry(vec![Arc::new(ListItems)]))
        .with_sink(Arc::new(ChannelSink::new(tx)))
        .build()
        .unwrap();

    let out = agent.run("list items").await;
    let mut received = Vec::new();
    while let Ok(e) = rx.try_recv() {
        received.push(e);
    }
    assert_eq!(received.len(), out.transcript.len());
    assert_eq!(received.first().map(|e| e.kind), Some(EventKind::LoopStart));
    assert_eq!(received.last().map(|e| e.kind), Some(EventKind::LoopEnd));
    let session = received[0].session_id;
    assert!(received.iter().all(|e| e.session_id == session));
    assert!(received.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_handle_appends_attachment_block() {
    let mock = Arc::new(MockLlmClient::new());
    let agent = AgentBuilder::new(AppConfig::default())
        .with_llm(mock.clone())
        .with_registry(registry(vec![Arc::new(ListItems)]))
        .build()
        .unwrap();

    let answer = agent.handle("Summarize the note", Some("BP 150/95, on lisinopril")).await;
    assert!(!answer.is_empty());
    let planning = mock
        .requests()
        .into_iter()
        .find(|r| r.purpose == RequestPurpose::Planning)
        .unwrap();
    assert!(planning.messages[1].content.contains("--- Attached document ---\nBP 150/95, on lisinopril"));
}

#[tokio::test]
async fn test_verify_phrasing_still_triggers_discovery() {
    let mock = Arc::new(
        MockLlmClient::new()
            .with_tool_call("search_records", json!({"code": "atrial fibrillation"}))
            .with_tool_call("sample_records", json!({}))
            .with_tool_call("search_records", json!({"code": "I48"}))
            .with(RequestPurpose::TaskValidation, not_done("retry the search with the discovered code")),
    );
    let agent = AgentBuilder::new(AppConfig::default())
        .with_llm(mock.clone())
        .with_registry(registry(vec![Arc::new(CodeSearch), Arc::new(Sampler)]))
        .build()
        .unwrap();

    let out = agent.run("Verify which patients have atrial fibrillation").await;
    let called: Vec<&str> = out
        .transcript
        .iter()
        .filter(|e| e.kind == EventKind::ToolCall)
        .filter_map(|e| e.payload["tool"].as_str())
        .collect();
    assert!(called.contains(&"sample_records"), "{called:?}");
    assert_eq!(mock.calls_for(RequestPurpose::TaskValidation), 2);
    assert!(out.answer.contains("p7"));
}

#[tokio::test]
async fn test_cancel_between_runs_does_not_poison_agent() {
    let mock = Arc::new(MockLlmClient::new());
    let agent = AgentBuilder::new(AppConfig::default())
        .with_llm(mock)
        .with_registry(registry(vec![Arc::new(ListItems)]))
        .build()
        .unwrap();

    agent.cancel();
    let first = agent.run("list items").await;
    let second = agent.run("list items again").await;
    assert!(first.abort.is_none());
    assert!(second.abort.is_none());
    assert!(!agent.cancel_token().is_cancelled());
}

#[tokio::test]
async fn test_cancel_stops_in_flight_run_only() {
    let mock = Arc::new(
        MockLlmClient::new()
            .with_tool_call("slow_step", json!({}))
            .with(RequestPurpose::TaskValidation, not_done("more steps needed")),
    );
    let agent = AgentBuilder::new(AppConfig::default())
        .with_llm(mock)
        .with_registry(registry(vec![Arc::new(SlowStep)]))
        .build()
        .unwrap();

    let (cancelled, _) = tokio::join!(agent.run("run the slow job"), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        agent.cancel();
    });
    assert_eq!(cancelled.abort, Some(AbortReason::Cancelled));
    assert_eq!(cancelled.steps, 1);

    let next = agent.run("run the slow job").await;
    assert!(next.abort.is_none());
}

#[tokio::test]
async fn test_shutdown_token_aborts_every_run() {
    let shutdown = tokio_util::sync::CancellationToken::new();
    let agent = AgentBuilder::new(AppConfig::default())
        .with_llm(Arc::new(MockLlmClient::new()))
        .with_registry(registry(vec![Arc::new(ListItems)]))
        .with_cancel_token(shutdown.clone())
        .build()
        .unwrap();

    shutdown.cancel();
    assert_eq!(agent.run("list items").await.abort, Some(AbortReason::Cancelled));
    agent.cancel();
    assert_eq!(agent.run("list items").await.abort, Some(AbortReason::Cancelled));
}
