//! 会话事件：按时间顺序记录的只写审计轨迹
//!
//! Transcript 由编排循环写入并同时分发给可选的 EventSink（通道 / tracing / JSONL 文件）；
//! 核心从不读回事件，sink 也不影响控制流。

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LoopStart,
    ReasoningRequest,
    ReasoningResponse,
    ToolCall,
    ToolResult,
    LoopEnd,
    Error,
}

/// 单条事件（可序列化为 JSON 供外部观察者使用）
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
}

/// 事件接收端
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// 推送到 tokio 通道（供 UI / 流式展示）
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &Event) {
        let _ = self.tx.send(event.clone());
    }
}

/// 写入 tracing；verbose 时以 info 级别输出完整 payload，否则 debug 级别
pub struct TracingSink {
    verbose: bool,
}

impl TracingSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: &Event) {
        if self.verbose {
            tracing::info!(session = %event.session_id, kind = ?event.kind, payload = %event.payload, "event");
        } else {
            tracing::debug!(session = %event.session_id, kind = ?event.kind, "event");
        }
    }
}

/// 每条事件追加为一行 JSON（debug_log）
pub struct JsonlSink {
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: &Event) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if let Ok(mut f) = self.file.lock() {
            if let Err(e) = writeln!(f, "{line}") {
                tracing::warn!(error = %e, "failed to write debug log");
            }
        }
    }
}

/// 单次会话的事件记录
pub struct Transcript {
    session_id: Uuid,
    events: Vec<Event>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Transcript {
    pub fn new(session_id: Uuid, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            session_id,
            events: Vec::new(),
            sinks,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn record(&mut self, kind: EventKind, payload: Value) {
        let event = Event {
            kind,
            payload,
            timestamp: Utc::now(),
            session_id: self.session_id,
        };
        for sink in &self.sinks {
            sink.emit(&event);
        }
        self.events.push(event);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transcript_fans_out_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut t = Transcript::new(Uuid::new_v4(), vec![Arc::new(ChannelSink::new(tx))]);
        t.record(EventKind::LoopStart, json!({"query": "q"}));
        t.record(EventKind::LoopEnd, json!({}));
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::LoopStart);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::LoopEnd);
        assert_eq!(t.count(EventKind::LoopEnd), 1);
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/events.jsonl");
        let sink = Arc::new(JsonlSink::open(&path).unwrap());
        let mut t = Transcript::new(Uuid::new_v4(), vec![sink]);
        t.record(EventKind::ToolCall, json!({"tool": "list_patients"}));
        t.record(EventKind::ToolResult, json!({"ok": true}));
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "tool_call");
    }
}
