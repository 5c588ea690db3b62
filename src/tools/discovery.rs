//! 探索工具：sample_records
//!
//! 采样原始 FHIR 资源并汇总字段约定（字段名、code 显示值、类别码），
//! 让后续分析基于数据集的真实取值，而不是推理服务假设的"标准"取值。

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::ToolError;
use crate::tools::fhir::{resources, FhirStore};
use crate::tools::schema::{parse_args, schema_value};
use crate::tools::Tool;

const MAX_EXAMPLE_VALUES: usize = 15;
const MAX_PATIENTS_SCANNED: usize = 25;

fn default_sample_limit() -> u32 {
    5
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SampleArgs {
    /// FHIR 资源类型（Observation、Condition、MedicationRequest、Patient 等）；省略则采样所有类型
    #[serde(default)]
    pub resource_type: Option<String>,
    /// 原始样本条数
    #[serde(default = "default_sample_limit")]
    pub limit: u32,
}

pub struct SampleRecordsTool {
    store: FhirStore,
}

impl SampleRecordsTool {
    pub fn new(store: FhirStore) -> Self {
        Self { store }
    }
}

fn code_display(resource: &Value) -> Option<String> {
    let code = resource
        .get("code")
        .or_else(|| resource.get("medicationCodeableConcept"))?;
    code.get("text")
        .and_then(|t| t.as_str())
        .or_else(|| {
            code.get("coding")
                .and_then(|c| c.as_array())
                .and_then(|c| c.first())
                .and_then(|c| c.get("display"))
                .and_then(|d| d.as_str())
        })
        .map(String::from)
}

#[async_trait]
impl Tool for SampleRecordsTool {
    fn name(&self) -> &str {
        "sample_records"
    }

    fn description(&self) -> &str {
        "Discovery tool: sample raw FHIR records and report the dataset's actual field names, code display \
         values and category codes. Call it before concluding that data is absent."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<SampleArgs>()
    }

    fn is_discovery(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: SampleArgs = parse_args(args)?;
        let want = args.resource_type.as_deref();
        let limit = args.limit as usize;
        let ids = self.store.patient_ids(Some(MAX_PATIENTS_SCANNED))?;

        let mut samples = Vec::new();
        let mut type_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut fields: BTreeSet<String> = BTreeSet::new();
        let mut codes: BTreeSet<String> = BTreeSet::new();
        let mut categories: BTreeSet<String> = BTreeSet::new();

        for id in &ids {
            let Ok(bundle) = self.store.load_bundle(id) else {
                continue;
            };
            let entries = bundle.get("entry").and_then(|e| e.as_array()).cloned().unwrap_or_default();
            for r in entries.iter().filter_map(|e| e.get("resource")) {
                let rtype = r.get("resourceType").and_then(|t| t.as_str()).unwrap_or("Unknown");
                *type_counts.entry(rtype.to_string()).or_default() += 1;
            }
            let matching: Vec<&Value> = match want {
                Some(t) => resources(&bundle, t).collect(),
                None => entries.iter().filter_map(|e| e.get("resource")).collect(),
            };
            for r in matching {
                if let Some(obj) = r.as_object() {
                    fields.extend(obj.keys().cloned());
                }
                if let Some(c) = code_display(r) {
                    if codes.len() < MAX_EXAMPLE_VALUES {
                        codes.insert(c);
                    }
                }
                for cat in r.get("category").and_then(|c| c.as_array()).into_iter().flatten() {
                    for coding in cat.get("coding").and_then(|c| c.as_array()).into_iter().flatten() {
                        if let Some(code) = coding.get("code").and_then(|c| c.as_str()) {
                            categories.insert(code.to_string());
                        }
                    }
                }
                if samples.len() < limit {
                    samples.push(json!({"patient_id": id, "resource": r}));
                }
            }
        }

        tracing::info!(
            resource_type = want.unwrap_or("*"),
            samples = samples.len(),
            patients = ids.len(),
            "sample_records tool execute"
        );
        Ok(json!({
            "patients_scanned": ids.len(),
            "resource_type_counts": type_counts,
            "field_conventions": {
                "fields": fields,
                "example_code_values": codes,
                "category_codes": categories,
            },
            "samples": samples,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fhir::fixtures;

    #[tokio::test]
    async fn test_sample_reports_conventions() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write(dir.path(), "p1", &fixtures::bundle("p1", "female", "1950-01-01", "Asthma", 6.0));
        let tool = SampleRecordsTool::new(FhirStore::new(dir.path()));
        let out = tool
            .execute(json!({"resource_type": "Observation", "limit": 1}))
            .await
            .unwrap();
        assert_eq!(out["samples"].as_array().unwrap().len(), 1);
        assert_eq!(out["resource_type_counts"]["Observation"], 2);
        let codes = out["field_conventions"]["example_code_values"].as_array().unwrap();
        assert!(codes.contains(&json!("Hemoglobin A1c")));
        let cats = out["field_conventions"]["category_codes"].as_array().unwrap();
        assert!(cats.contains(&json!("vital-signs")));
        assert!(tool.is_discovery());
    }
}
