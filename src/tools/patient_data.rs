//! 患者数据工具：list_patients / get_patient_data

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::ToolError;
use crate::tools::fhir::{self, FhirStore};
use crate::tools::schema::{parse_args, schema_value};
use crate::tools::Tool;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListPatientsArgs {
    /// 最多返回多少个 ID；省略则返回全部
    #[serde(default)]
    pub limit: Option<u32>,
}

/// 列出可用患者 ID
pub struct ListPatientsTool {
    store: FhirStore,
}

impl ListPatientsTool {
    pub fn new(store: FhirStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ListPatientsTool {
    fn name(&self) -> &str {
        "list_patients"
    }

    fn description(&self) -> &str {
        "List available patient IDs in the clinical dataset. Use it to discover which patients exist."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<ListPatientsArgs>()
    }

    fn is_discovery(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: ListPatientsArgs = parse_args(args)?;
        let ids = self.store.patient_ids(args.limit.map(|n| n as usize))?;
        tracing::info!(count = ids.len(), "list_patients tool execute");
        Ok(json!({"count": ids.len(), "patient_ids": ids}))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Demographics,
    Labs,
    Vitals,
    Medications,
    Conditions,
    /// 临床文书（病程记录、SOAP、出院小结、检查报告正文）
    Notes,
    All,
}

fn default_data_types() -> Vec<DataType> {
    vec![DataType::All]
}

fn default_record_limit() -> u32 {
    50
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PatientDataArgs {
    /// 患者 ID（来自 list_patients 或 search_patients）
    pub patient_id: String,
    /// 需要的数据类别
    #[serde(default = "default_data_types")]
    pub data_types: Vec<DataType>,
    /// 每个类别最多返回的条目数（按日期倒序）
    #[serde(default = "default_record_limit")]
    pub limit: u32,
    /// 检验 / 生命体征名称过滤（不区分大小写的子串）
    #[serde(default)]
    pub code_filter: Option<String>,
}

/// 获取单个患者的临床数据
pub struct PatientDataTool {
    store: FhirStore,
}

impl PatientDataTool {
    pub fn new(store: FhirStore) -> Self {
        Self { store }
    }
}

fn newest_first(mut items: Vec<Value>, date_key: &str, limit: usize) -> Vec<Value> {
    items.sort_by(|a, b| {
        let da = a.get(date_key).and_then(|v| v.as_str()).unwrap_or("");
        let db = b.get(date_key).and_then(|v| v.as_str()).unwrap_or("");
        db.cmp(da)
    });
    items.truncate(limit);
    items
}

#[async_trait]
impl Tool for PatientDataTool {
    fn name(&self) -> &str {
        "get_patient_data"
    }

    fn description(&self) -> &str {
        "Retrieve one patient's clinical record: demographics, labs, vitals, medications, conditions and \
         clinical notes (progress/SOAP notes, discharge summaries, report text). Requires a patient_id."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<PatientDataArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: PatientDataArgs = parse_args(args)?;
        tracing::info!(patient_id = %args.patient_id, "get_patient_data tool execute");
        let bundle = self.store.load_bundle(&args.patient_id)?;
        let wants = |t: DataType| args.data_types.contains(&DataType::All) || args.data_types.contains(&t);
        let limit = args.limit as usize;
        let filter = args.code_filter.as_deref().map(str::to_lowercase);
        let matches_code = |obs: &Value| match &filter {
            Some(f) => obs
                .get("code")
                .and_then(|c| c.as_str())
                .map(|c| c.to_lowercase().contains(f.as_str()))
                .unwrap_or(false),
            None => true,
        };

        let mut out = Map::new();
        out.insert("patient_id".into(), json!(args.patient_id));
        if wants(DataType::Demographics) {
            out.insert(
                "demographics".into(),
                fhir::demographics(&bundle).unwrap_or(Value::Null),
            );
        }
        let observations = fhir::observations(&bundle);
        if wants(DataType::Labs) {
            let labs: Vec<Value> = observations
                .iter()
                .filter(|o| fhir::has_category(o, "laboratory") && matches_code(o))
                .cloned()
                .collect();
            out.insert("lab_count".into(), json!(labs.len()));
            out.insert("labs".into(), json!(newest_first(labs, "effective", limit)));
        }
        if wants(DataType::Vitals) {
            let vitals: Vec<Value> = observations
                .iter()
                .filter(|o| fhir::has_category(o, "vital-signs") && matches_code(o))
                .cloned()
                .collect();
            out.insert("vital_count".into(), json!(vitals.len()));
            out.insert("vitals".into(), json!(newest_first(vitals, "effective", limit)));
        }
        if wants(DataType::Medications) {
            let meds = fhir::medications(&bundle);
            out.insert("medication_count".into(), json!(meds.len()));
            out.insert("medications".into(), json!(newest_first(meds, "authored_on", limit)));
        }
        if wants(DataType::Conditions) {
            let conds = fhir::conditions(&bundle);
            out.insert("condition_count".into(), json!(conds.len()));
            out.insert("conditions".into(), json!(newest_first(conds, "onset_date", limit)));
        }
        if wants(DataType::Notes) {
            let notes = fhir::clinical_notes(&bundle);
            out.insert("note_count".into(), json!(notes.len()));
            out.insert("notes".into(), json!(newest_first(notes, "date", limit)));
        }
        Ok(Value::Object(out))
    }
}
