//! 患者队列检索工具：search_patients
//!
//! 在工具内部完成整个队列扫描（批处理），Planner 的"人群类请求只拆一个任务"规则依赖于此。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::ToolError;
use crate::tools::fhir::{self, FhirStore};
use crate::tools::schema::{parse_args, schema_value};
use crate::tools::Tool;

fn default_search_limit() -> u32 {
    20
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchArgs {
    /// 诊断名称子串（不区分大小写），如 "diabetes"
    #[serde(default)]
    pub condition: Option<String>,
    /// 用药名称子串，如 "metformin"
    #[serde(default)]
    pub medication: Option<String>,
    /// 检验名称子串，如 "a1c"；配合 lab_min / lab_max 使用
    #[serde(default)]
    pub lab_name: Option<String>,
    #[serde(default)]
    pub lab_min: Option<f64>,
    #[serde(default)]
    pub lab_max: Option<f64>,
    /// 最多返回的匹配患者数
    #[serde(default = "default_search_limit")]
    pub limit: u32,
}

impl SearchArgs {
    fn filters_applied(&self) -> Value {
        let mut f = serde_json::Map::new();
        if let Some(c) = &self.condition {
            f.insert("condition".into(), json!(c));
        }
        if let Some(m) = &self.medication {
            f.insert("medication".into(), json!(m));
        }
        if let Some(l) = &self.lab_name {
            f.insert("lab_name".into(), json!(l));
        }
        if let Some(v) = self.lab_min {
            f.insert("lab_min".into(), json!(v));
        }
        if let Some(v) = self.lab_max {
            f.insert("lab_max".into(), json!(v));
        }
        Value::Object(f)
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// 单个患者是否满足所有过滤条件；满足时返回匹配到的内容
fn match_patient(bundle: &Value, args: &SearchArgs) -> Option<Value> {
    let mut matched = serde_json::Map::new();

    if let Some(cond) = &args.condition {
        let hit = fhir::conditions(bundle)
            .into_iter()
            .filter_map(|c| c.get("name").and_then(|n| n.as_str()).map(String::from))
            .find(|n| contains_ci(n, cond))?;
        matched.insert("condition".into(), json!(hit));
    }

    if let Some(med) = &args.medication {
        let hit = fhir::medications(bundle)
            .into_iter()
            .filter_map(|m| m.get("medication").and_then(|n| n.as_str()).map(String::from))
            .find(|n| contains_ci(n, med))?;
        matched.insert("medication".into(), json!(hit));
    }

    if let Some(lab) = &args.lab_name {
        let hit = fhir::observations(bundle).into_iter().find(|o| {
            let name_ok = o
                .get("code")
                .and_then(|c| c.as_str())
                .map(|c| contains_ci(c, lab))
                .unwrap_or(false);
            if !name_ok {
                return false;
            }
            match o.get("value").and_then(|v| v.as_f64()) {
                Some(v) => args.lab_min.map_or(true, |m| v >= m) && args.lab_max.map_or(true, |m| v <= m),
                None => args.lab_min.is_none() && args.lab_max.is_none(),
            }
        })?;
        matched.insert(
            "lab".into(),
            json!({"code": hit["code"], "value": hit["value"], "unit": hit["unit"]}),
        );
    }

    Some(Value::Object(matched))
}

/// 按诊断 / 用药 / 检验值范围筛选患者队列
pub struct SearchPatientsTool {
    store: FhirStore,
}

impl SearchPatientsTool {
    pub fn new(store: FhirStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SearchPatientsTool {
    fn name(&self) -> &str {
        "search_patients"
    }

    fn description(&self) -> &str {
        "Batch cohort search over all patients. Filters by condition, medication and/or lab value range \
         in a single call; use it for population questions instead of listing patients one by one."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<SearchArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: SearchArgs = parse_args(args)?;
        if (args.lab_min.is_some() || args.lab_max.is_some()) && args.lab_name.is_none() {
            return Err(ToolError::invalid_arguments("lab_min/lab_max require lab_name"));
        }
        let ids = self.store.patient_ids(None)?;
        let limit = args.limit as usize;
        let mut matches = Vec::new();
        let mut total_matches = 0usize;
        let mut skipped = 0usize;

        for id in &ids {
            let bundle = match self.store.load_bundle(id) {
                Ok(b) => b,
                Err(e) => {
                    tracing::debug!(patient_id = %id, error = %e, "skipping unreadable bundle");
                    skipped += 1;
                    continue;
                }
            };
            if let Some(matched) = match_patient(&bundle, &args) {
                total_matches += 1;
                if matches.len() < limit {
                    matches.push(json!({"patient_id": id, "matched": matched}));
                }
            }
        }

        tracing::info!(scanned = ids.len(), total_matches, "search_patients tool execute");
        let patient_ids: Vec<Value> = matches.iter().map(|m| m["patient_id"].clone()).collect();
        Ok(json!({
            "count": total_matches,
            "patient_ids": patient_ids,
            "matches": matches,
            "filters_applied": args.filters_applied(),
            "scanned": ids.len(),
            "skipped": skipped,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fhir::fixtures;

    fn cohort() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write(dir.path(), "p1", &fixtures::bundle("p1", "female", "1950-01-01", "Diabetes mellitus type 2", 8.2));
        fixtures::write(dir.path(), "p2", &fixtures::bundle("p2", "male", "1960-01-01", "Diabetes mellitus type 2", 6.1));
        fixtures::write(dir.path(), "p3", &fixtures::bundle("p3", "male", "1970-01-01", "Hypertension", 5.2));
        dir
    }

    #[tokio::test]
    async fn test_condition_and_lab_range() {
        let dir = cohort();
        let tool = SearchPatientsTool::new(FhirStore::new(dir.path()));
        let out = tool
            .execute(json!({"condition": "diabetes", "lab_name": "a1c", "lab_min": 7.0}))
            .await
            .unwrap();
        assert_eq!(out["count"], 1);
        assert_eq!(out["patient_ids"], json!(["p1"]));
        assert_eq!(out["scanned"], 3);
    }

    #[tokio::test]
    async fn test_count_reports_all_matches_beyond_limit() {
        let dir = cohort();
        let tool = SearchPatientsTool::new(FhirStore::new(dir.path()));
        let out = tool.execute(json!({"medication": "metformin", "limit": 1})).await.unwrap();
        assert_eq!(out["count"], 3);
        assert_eq!(out["patient_ids"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_range_without_lab_name_rejected() {
        let dir = cohort();
        let tool = SearchPatientsTool::new(FhirStore::new(dir.path()));
        let err = tool.execute(json!({"lab_min": 1.0})).await.unwrap_err();
        assert_eq!(err.kind, crate::core::ToolErrorKind::InvalidArguments);
    }
}
