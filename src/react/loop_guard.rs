//! Loop Guard：基于最近 4 次已执行动作的重复检测
//!
//! 参数先做归一化（去掉 null / 空字符串，字符串 trim，自由文本字段小写，数字按 f64 比较；
//! `id` / `*_id` / `*_ids` 等标识符字段保留大小写），
//! 窗口内出现至少 2 次"近似相同"的 (tool, args) 即判定为重复。

use std::collections::VecDeque;

use serde_json::{Map, Value};

use crate::react::evidence::Action;

pub const WINDOW_SIZE: usize = 4;
const REPEAT_THRESHOLD: usize = 2;

/// 固定大小的滑动窗口
#[derive(Debug, Clone, Default)]
pub struct ActionWindow {
    recent: VecDeque<Action>,
}

impl ActionWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Action) {
        if self.recent.len() == WINDOW_SIZE {
            self.recent.pop_front();
        }
        self.recent.push_back(action);
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.recent.iter()
    }
}

/// 标识符（如 FHIR 资源 id）区分大小写
fn is_identifier_key(key: &str) -> bool {
    key == "id" || key.ends_with("_id") || key.ends_with("_ids")
}

fn normalize(v: &Value, fold_case: bool) -> Value {
    match v {
        Value::String(s) if fold_case => Value::String(s.trim().to_lowercase()),
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Number(n) => n.as_f64().map(Value::from).unwrap_or_else(|| v.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|i| normalize(i, fold_case)).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, child) in map {
                let empty = match child {
                    Value::Null => true,
                    Value::String(s) => s.trim().is_empty(),
                    _ => false,
                };
                if !empty {
                    out.insert(k.clone(), normalize(child, fold_case && !is_identifier_key(k)));
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn near_identical(a: &Action, b: &Action) -> bool {
    a.tool_name == b.tool_name && normalize(&a.arguments, true) == normalize(&b.arguments, true)
}

/// 纯函数：proposed 是否与窗口中的动作重复
pub fn is_repetitive(recent: &ActionWindow, proposed: &Action) -> bool {
    recent.iter().filter(|a| near_identical(a, proposed)).count() >= REPEAT_THRESHOLD
}
