//! Planner：把用户请求拆解为有序任务列表
//!
//! 一次结构化推理调用（TaskList schema），随后做确定性的拆解规则修正：
//! - 人群 / 队列类请求：若被拆成"先枚举再分析"，合并为一个交给批处理工具的任务
//! - 影像 / 多模态请求：强制为恰好两个任务（先探索数据约定，再基于发现做影像分析）

use std::sync::{Arc, OnceLock};

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::{AgentError, Task};
use crate::llm::{LlmClient, LlmRequest, Message, RequestPurpose};
use crate::react::events::Transcript;
use crate::react::{prompts, reasoning};
use crate::tools::schema::schema_value;

/// Planner 结构化输出中的单个任务
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlannedTask {
    pub id: usize,
    pub description: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskList {
    pub tasks: Vec<PlannedTask>,
}

const POPULATION_MARKERS: &[&str] = &[
    "all patients",
    "patients with",
    "patients who",
    "patients on",
    "how many patients",
    "which patients",
    "number of patients",
    "percentage of patients",
    "proportion of patients",
    "cohort",
    "population",
];

/// 影像 / 多模态关键词（整词匹配，避免 "imagine"、"scanned" 误判）
static IMAGING_RE: OnceLock<Regex> = OnceLock::new();

const ENUMERATION_VERBS: &[&str] = &["list", "enumerate", "identify", "find", "retrieve", "get all", "collect"];

/// 紧随枚举任务、仍作用于同一批患者的后续任务
const COHORT_FOLLOWUP_MARKERS: &[&str] = &[
    "each patient",
    "every patient",
    "these patients",
    "those patients",
    "the patients",
    "each of",
    "for each",
    "their ",
    "cohort",
];

const DISCOVERY_MARKERS: &[&str] = &["sample", "discover", "explore", "field", "convention", "structure"];

fn mentions(text: &str, markers: &[&str]) -> bool {
    let lower = text.to_lowercase();
    markers.iter().any(|m| lower.contains(m))
}

pub fn is_population_query(query: &str) -> bool {
    mentions(query, POPULATION_MARKERS)
}

pub fn is_imaging_query(query: &str) -> bool {
    let re = IMAGING_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(images?|imaging|x-?rays?|radiographs?|ecgs?|ekgs?|dicom|scans?|mri)\b").unwrap()
    });
    re.is_match(query)
}

fn renumber(descriptions: Vec<String>) -> Vec<Task> {
    descriptions
        .into_iter()
        .enumerate()
        .map(|(i, d)| Task::new(i + 1, d))
        .collect()
}

/// 对推理服务给出的任务描述应用拆解规则
pub fn enforce_decomposition_rules(query: &str, mut descriptions: Vec<String>) -> Vec<String> {
    descriptions.retain(|d| !d.trim().is_empty());
    if descriptions.is_empty() {
        return vec![query.to_string()];
    }

    if is_imaging_query(query) {
        let (discovery, rest) = match descriptions.first() {
            Some(first) if mentions(first, DISCOVERY_MARKERS) => {
                (first.clone(), descriptions[1..].to_vec())
            }
            _ => (
                format!(
                    "Sample the raw records with sample_records to learn the dataset's field names and value conventions relevant to: {query}"
                ),
                descriptions.clone(),
            ),
        };
        let analysis = if rest.is_empty() {
            query.to_string()
        } else {
            rest.join("; ")
        };
        let analysis = if analysis.contains("analyze_image") {
            analysis
        } else {
            format!("{analysis} (use analyze_image, conditioned on the conventions found in task 1)")
        };
        return vec![discovery, analysis];
    }

    if is_population_query(query) && descriptions.len() >= 2 {
        let first = &descriptions[0];
        if mentions(first, ENUMERATION_VERBS) && first.to_lowercase().contains("patient") {
            // 第二个任务无条件并入；其后仍针对同一批患者的任务一并并入
            let absorbed = 2 + descriptions[2..]
                .iter()
                .take_while(|d| mentions(d, COHORT_FOLLOWUP_MARKERS))
                .count();
            let rest = descriptions.split_off(absorbed);
            let merged = format!(
                "{} (single batch call with search_patients)",
                descriptions.join("; ")
            );
            let mut out = vec![merged];
            out.extend(rest);
            return out;
        }
    }

    descriptions
}

/// Planner：持有推理网关
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 规划失败时的兜底：整个请求作为单个任务
    pub fn fallback(query: &str) -> Vec<Task> {
        vec![Task::new(1, query)]
    }

    pub async fn plan(&self, query: &str, transcript: &mut Transcript) -> Result<Vec<Task>, AgentError> {
        let request = LlmRequest::new(
            RequestPurpose::Planning,
            vec![
                Message::system(prompts::PLANNING_SYSTEM),
                Message::user(format!("User query:\n{query}")),
            ],
        )
        .with_schema("task_list", schema_value::<TaskList>());

        let list: TaskList = reasoning::complete_structured(self.llm.as_ref(), &request, transcript).await?;
        let mut planned = list.tasks;
        planned.sort_by_key(|t| t.id);
        let descriptions = planned.into_iter().map(|t| t.description).collect();
        let tasks = renumber(enforce_decomposition_rules(query, descriptions));
        tracing::info!(tasks = tasks.len(), "plan ready");
        Ok(tasks)
    }
}
