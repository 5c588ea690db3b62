//! Context Manager：约束发往推理服务的证据规模
//!
//! - 单条输出上限：保留开头与结尾各 40%，中间插入截断标记
//! - 列表摘要：只保留前 N 项，附 `{key}_total_count` / `{key}_truncated`，并在正文前加一行摘要头
//! - 总量上限：超出预算时从最旧的输出开始丢弃正文；进行中任务的输出与最后一条输出不会被丢弃
//!
//! 任务元数据（id、描述、状态）以及被丢弃输出的工具名 / 任务 id 始终保留。

use serde_json::{Map, Value};

use crate::core::Task;
use crate::react::evidence::ToolOutput;

/// 规模参数（来自配置 [context]）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextLimits {
    pub chars_per_token: f64,
    pub max_output_tokens: usize,
    pub max_single_output_tokens: usize,
    pub max_list_items: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            chars_per_token: 3.5,
            max_output_tokens: 50_000,
            max_single_output_tokens: 10_000,
            max_list_items: 20,
        }
    }
}

impl ContextLimits {
    pub fn single_output_chars(&self) -> usize {
        (self.max_single_output_tokens as f64 * self.chars_per_token) as usize
    }

    pub fn total_chars(&self) -> usize {
        (self.max_output_tokens as f64 * self.chars_per_token) as usize
    }
}

/// 发往推理服务的证据文本
#[derive(Debug, Clone, Default)]
pub struct RenderedEvidence {
    pub text: String,
    /// 被丢弃正文的输出（sequence_index）
    pub evicted: Vec<usize>,
    pub estimated_tokens: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ContextManager {
    limits: ContextLimits,
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn byte_offset(s: &str, char_idx: usize) -> usize {
    s.char_indices().nth(char_idx).map(|(i, _)| i).unwrap_or(s.len())
}

fn marker(removed: usize, chars_per_token: f64) -> String {
    let tokens = (removed as f64 / chars_per_token) as usize;
    format!("\n... [TRUNCATED: {removed} chars (~{tokens} tokens) removed] ...\n")
}

impl ContextManager {
    pub fn new(limits: ContextLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ContextLimits {
        &self.limits
    }

    /// 按固定字符/token 比估算 token 数
    pub fn estimate_tokens(&self, text: &str) -> usize {
        (char_len(text) as f64 / self.limits.chars_per_token) as usize
    }

    /// 单条输出截断：结果长度不超过 max_chars
    pub fn truncate_output(&self, text: &str, max_chars: usize) -> String {
        let len = char_len(text);
        if len <= max_chars {
            return text.to_string();
        }
        // 以原始长度估算标记长度上界，保证总长不超限
        let marker_upper = char_len(&marker(len, self.limits.chars_per_token));
        if max_chars <= marker_upper {
            return text[..byte_offset(text, max_chars)].to_string();
        }
        let keep = ((max_chars as f64 * 0.4) as usize).min((max_chars - marker_upper) / 2);
        let head = &text[..byte_offset(text, keep)];
        let tail = &text[byte_offset(text, len - keep)..];
        format!(
            "{head}{}{tail}",
            marker(len - 2 * keep, self.limits.chars_per_token)
        )
    }

    /// 列表摘要；返回摘要后的值与 (路径, 原始长度) 列表
    pub fn summarize_list_result(&self, value: &Value) -> (Value, Vec<(String, usize)>) {
        let mut summaries = Vec::new();
        let max = self.limits.max_list_items;
        let out = match value {
            Value::Array(items) if items.len() > max => {
                summaries.push(("items".to_string(), items.len()));
                let mut obj = Map::new();
                obj.insert(
                    "items".into(),
                    Value::Array(
                        items[..max]
                            .iter()
                            .map(|v| summarize_inner(v, max, "items", &mut summaries))
                            .collect(),
                    ),
                );
                obj.insert("items_total_count".into(), Value::from(items.len()));
                obj.insert("items_truncated".into(), Value::Bool(true));
                Value::Object(obj)
            }
            other => summarize_inner(other, max, "", &mut summaries),
        };
        (out, summaries)
    }

    /// 单条输出的上下文文本：列表摘要 → 序列化 → 单条截断
    ///
    /// 列表摘要头紧跟在工具名之后，保证任意深度的截断后 total_count 仍可见。
    pub fn format_output(&self, output: &ToolOutput) -> String {
        let mut header = format!("[#{} task {}] {}", output.sequence_index, output.task_id, output.tool_name);
        let body = if output.is_error() {
            output.body()
        } else {
            let (summarized, lists) = self.summarize_list_result(&output.result);
            if !lists.is_empty() {
                let notes: Vec<String> = lists
                    .iter()
                    .map(|(path, total)| format!("{path} total_count={total} truncated=true"))
                    .collect();
                header.push_str(&format!(" [list summary: {}]", notes.join("; ")));
            }
            match &summarized {
                Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
            }
        };
        self.truncate_output(
            &format!("{header} args {}:\n{body}", output.arguments),
            self.limits.single_output_chars(),
        )
    }

    /// 渲染完整证据：任务元数据 + 输出（必要时按最旧优先丢弃正文）
    ///
    /// protect_task 为进行中任务 id，其输出永不丢弃；最后一条输出同样受保护。
    pub fn render_evidence(
        &self,
        tasks: &[Task],
        outputs: &[&ToolOutput],
        protect_task: Option<usize>,
    ) -> RenderedEvidence {
        let mut text = String::new();
        if !tasks.is_empty() {
            text.push_str("Tasks:\n");
            for t in tasks {
                text.push_str(&format!("- [{}] ({:?}) {}\n", t.id, t.status, t.description));
            }
            text.push('\n');
        }

        let formatted: Vec<String> = outputs.iter().map(|o| self.format_output(o)).collect();
        let total: usize = formatted.iter().map(|f| char_len(f) + 1).sum();
        let budget = self.limits.total_chars();
        let mut keep = vec![true; outputs.len()];

        if total > budget {
            let target = (budget as f64 * 0.8) as usize;
            let last = outputs.len().saturating_sub(1);
            let mut size = total;
            for (i, o) in outputs.iter().enumerate() {
                if size <= target {
                    break;
                }
                let protected = i == last || Some(o.task_id) == protect_task;
                if protected {
                    continue;
                }
                keep[i] = false;
                size -= char_len(&formatted[i]) + 1;
            }
        }

        let evicted: Vec<usize> = outputs
            .iter()
            .zip(&keep)
            .filter(|(_, k)| !**k)
            .map(|(o, _)| o.sequence_index)
            .collect();
        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), kept = outputs.len() - evicted.len(), "context budget exceeded");
            text.push_str(&format!(
                "[CONTEXT MANAGER: {} earlier outputs truncated to fit context limit. Keeping {} most recent outputs.]\n\n",
                evicted.len(),
                outputs.len() - evicted.len()
            ));
        }

        for ((o, f), k) in outputs.iter().zip(&formatted).zip(&keep) {
            if *k {
                text.push_str(f);
            } else {
                text.push_str(&format!(
                    "[#{} task {}] Output of {} omitted",
                    o.sequence_index, o.task_id, o.tool_name
                ));
            }
            text.push('\n');
        }

        let estimated_tokens = self.estimate_tokens(&text);
        RenderedEvidence {
            text,
            evicted,
            estimated_tokens,
        }
    }
}

fn summarize_inner(
    value: &Value,
    max: usize,
    path: &str,
    summaries: &mut Vec<(String, usize)>,
) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };
    let mut out = Map::new();
    for (key, v) in map {
        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };
        match v {
            Value::Array(items) if items.len() > max => {
                let count_key = format!("{key}_total_count");
                let total = map
                    .get(&count_key)
                    .and_then(|c| c.as_u64())
                    .map(|c| c as usize)
                    .unwrap_or(items.len());
                summaries.push((child_path.clone(), total));
                out.insert(
                    key.clone(),
                    Value::Array(
                        items[..max]
                            .iter()
                            .map(|i| summarize_inner(i, max, &child_path, summaries))
                            .collect(),
                    ),
                );
                out.insert(count_key, Value::from(total));
                out.insert(format!("{key}_truncated"), Value::Bool(true));
            }
            Value::Object(_) => {
                out.insert(key.clone(), summarize_inner(v, max, &child_path, summaries));
            }
            other => {
                if !out.contains_key(key) {
                    out.insert(key.clone(), other.clone());
                }
            }
        }
    }
    Value::Object(out)
}
