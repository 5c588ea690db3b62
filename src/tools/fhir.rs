//! FHIR 数据访问
//!
//! DataRoot 绑定根目录，所有路径经 resolve 校验必须在根下（禁止 ../ 逃逸）；
//! FhirStore 在其上读取 `<root>/<patient_id>.json` 形式的 FHIR Bundle，并提取患者、检验、诊断、用药。

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::core::ToolError;

/// 沙箱目录：绑定根目录，resolve 校验路径在根下
#[derive(Debug, Clone)]
pub struct DataRoot {
    root_dir: PathBuf,
}

impl DataRoot {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn path(&self) -> &Path {
        &self.root_dir
    }

    /// 解析相对路径；不存在返回 missing_data，逃逸出根目录返回 invalid_arguments
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, ToolError> {
        let rel = rel.trim_start_matches("./");
        let full = self.root_dir.join(rel);
        let canonical = full
            .canonicalize()
            .map_err(|_| ToolError::missing_data(format!("Path not found: {rel}")))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(ToolError::invalid_arguments(format!("Path escapes data root: {rel}")))
        }
    }

    /// 根目录下（不递归）的文件，按文件名排序
    pub fn files_in(&self, rel: &str, extensions: &[&str]) -> Result<Vec<PathBuf>, ToolError> {
        let dir = if rel.is_empty() || rel == "." {
            if !self.root_dir.is_dir() {
                return Err(ToolError::missing_data(format!(
                    "Data directory not found: {}",
                    self.root_dir.display()
                )));
            }
            self.root_dir.clone()
        } else {
            self.resolve(rel)?
        };
        let mut files: Vec<PathBuf> = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .and_then(|x| x.to_str())
                    .map(|x| extensions.iter().any(|want| x.eq_ignore_ascii_case(want)))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

/// 患者 ID 只能是单个路径分量
pub fn check_patient_id(patient_id: &str) -> Result<&str, ToolError> {
    let id = patient_id.trim();
    if id.is_empty() {
        return Err(ToolError::invalid_arguments("patient_id must not be empty"));
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(ToolError::invalid_arguments(format!("Invalid patient_id: {id}")));
    }
    Ok(id)
}

/// 基于文件的 FHIR 存储（每位患者一个 Bundle 文件）
#[derive(Debug, Clone)]
pub struct FhirStore {
    root: DataRoot,
}

impl FhirStore {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            root: DataRoot::new(root_dir),
        }
    }

    /// 可用患者 ID（文件名去掉 .json），按名称排序
    pub fn patient_ids(&self, limit: Option<usize>) -> Result<Vec<String>, ToolError> {
        let ids = self
            .root
            .files_in(".", &["json"])?
            .into_iter()
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from));
        Ok(match limit {
            Some(n) => ids.take(n).collect(),
            None => ids.collect(),
        })
    }

    /// 加载患者 Bundle：先精确匹配 `<id>.json`，否则取第一个文件名包含 id 的文件
    pub fn load_bundle(&self, patient_id: &str) -> Result<Value, ToolError> {
        let id = check_patient_id(patient_id)?;
        let path = match self.root.resolve(&format!("{id}.json")) {
            Ok(p) => p,
            Err(_) => self
                .root
                .files_in(".", &["json"])?
                .into_iter()
                .find(|p| {
                    p.file_stem()
                        .and_then(|s| s.to_str())
                        .map(|s| s.contains(id))
                        .unwrap_or(false)
                })
                .ok_or_else(|| ToolError::missing_data(format!("Patient {id} not found")))?,
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ToolError::execution_failed(format!("Read failed: {e}")))?;
        serde_json::from_str(&text)
            .map_err(|e| ToolError::execution_failed(format!("Invalid FHIR bundle for {id}: {e}")))
    }
}

/// Bundle 中指定类型的资源
pub fn resources<'a>(bundle: &'a Value, resource_type: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
    bundle
        .get("entry")
        .and_then(|e| e.as_array())
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("resource"))
        .filter(move |r| r.get("resourceType").and_then(|t| t.as_str()) == Some(resource_type))
}

fn str_at<'a>(v: &'a Value, path: &[&str]) -> &'a str {
    let mut cur = v;
    for key in path {
        match cur.get(*key) {
            Some(next) => cur = next,
            None => return "",
        }
    }
    cur.as_str().unwrap_or("")
}

/// CodeableConcept 的显示文本：text 优先，其次 coding[0].display
fn concept_text(concept: Option<&Value>) -> String {
    let Some(c) = concept else {
        return String::new();
    };
    let text = str_at(c, &["text"]);
    if !text.is_empty() {
        return text.to_string();
    }
    c.get("coding")
        .and_then(|x| x.as_array())
        .and_then(|x| x.first())
        .map(|x| str_at(x, &["display"]).to_string())
        .unwrap_or_default()
}

fn codings(field: Option<&Value>) -> Vec<String> {
    field
        .and_then(|f| f.as_array())
        .into_iter()
        .flatten()
        .filter_map(|cat| cat.get("coding").and_then(|c| c.as_array()))
        .flatten()
        .filter_map(|c| c.get("code").and_then(|x| x.as_str()))
        .map(String::from)
        .collect()
}

/// 人口学信息
pub fn demographics(bundle: &Value) -> Option<Value> {
    let p = resources(bundle, "Patient").next()?;
    let name = p
        .get("name")
        .and_then(|n| n.as_array())
        .and_then(|n| n.first())
        .map(|n| {
            let given = n
                .get("given")
                .and_then(|g| g.as_array())
                .map(|g| g.iter().filter_map(|x| x.as_str()).collect::<Vec<_>>().join(" "))
                .unwrap_or_default();
            format!("{} {}", given, str_at(n, &["family"])).trim().to_string()
        })
        .unwrap_or_default();
    Some(json!({
        "id": str_at(p, &["id"]),
        "name": name,
        "gender": str_at(p, &["gender"]),
        "birth_date": str_at(p, &["birthDate"]),
        "deceased": p.get("deceasedDateTime").is_some(),
    }))
}

/// Observation：code / value / unit / 日期 / 类别（laboratory、vital-signs 等）
pub fn observations(bundle: &Value) -> Vec<Value> {
    resources(bundle, "Observation")
        .map(|r| {
            let (value, unit) = if let Some(q) = r.get("valueQuantity") {
                (q.get("value").cloned().unwrap_or(Value::Null), str_at(q, &["unit"]).to_string())
            } else if let Some(s) = r.get("valueString") {
                (s.clone(), String::new())
            } else if r.get("valueCodeableConcept").is_some() {
                (json!(concept_text(r.get("valueCodeableConcept"))), String::new())
            } else {
                (Value::Null, String::new())
            };
            json!({
                "code": concept_text(r.get("code")),
                "value": value,
                "unit": unit,
                "effective": str_at(r, &["effectiveDateTime"]),
                "status": str_at(r, &["status"]),
                "category": codings(r.get("category")),
            })
        })
        .collect()
}

pub fn conditions(bundle: &Value) -> Vec<Value> {
    resources(bundle, "Condition")
        .map(|r| {
            let clinical_status = r
                .get("clinicalStatus")
                .and_then(|c| c.get("coding"))
                .and_then(|c| c.as_array())
                .and_then(|c| c.first())
                .map(|c| str_at(c, &["code"]).to_string())
                .unwrap_or_default();
            let onset = match str_at(r, &["onsetDateTime"]) {
                "" => str_at(r, &["onsetPeriod", "start"]),
                s => s,
            };
            json!({
                "name": concept_text(r.get("code")),
                "clinical_status": clinical_status,
                "onset_date": onset,
                "abatement_date": str_at(r, &["abatementDateTime"]),
            })
        })
        .collect()
}

pub fn medications(bundle: &Value) -> Vec<Value> {
    resources(bundle, "MedicationRequest")
        .map(|r| {
            let dosage = r
                .get("dosageInstruction")
                .and_then(|d| d.as_array())
                .and_then(|d| d.first())
                .map(|d| str_at(d, &["text"]).to_string())
                .unwrap_or_default();
            json!({
                "medication": concept_text(r.get("medicationCodeableConcept")),
                "status": str_at(r, &["status"]),
                "authored_on": str_at(r, &["authoredOn"]),
                "dosage": dosage,
            })
        })
        .collect()
}

/// Attachment 正文：内联 base64 data 解码为文本，只有 url 时给出引用
fn attachment_text(attachment: &Value) -> String {
    if let Some(data) = attachment.get("data").and_then(|d| d.as_str()) {
        return match STANDARD.decode(data.trim()) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::debug!(error = %e, "attachment data is not valid base64");
                String::new()
            }
        };
    }
    match attachment.get("url").and_then(|u| u.as_str()) {
        Some(url) => format!("[Content available at: {url}]"),
        None => String::new(),
    }
}

/// 文本中出现的 SOAP 段落标题
fn soap_sections(text: &str) -> Vec<&'static str> {
    let lower = text.to_lowercase();
    ["subjective", "objective", "assessment", "plan"]
        .into_iter()
        .filter(|s| lower.contains(&format!("{s}:")))
        .collect()
}

/// 临床文书：DocumentReference（病程记录、出院小结等）与 DiagnosticReport 的正文
pub fn clinical_notes(bundle: &Value) -> Vec<Value> {
    let documents = resources(bundle, "DocumentReference").map(|r| {
        let text = r
            .get("content")
            .and_then(|c| c.as_array())
            .into_iter()
            .flatten()
            .filter_map(|c| c.get("attachment"))
            .map(attachment_text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let author = r
            .get("author")
            .and_then(|a| a.as_array())
            .and_then(|a| a.first())
            .map(|a| {
                let display = str_at(a, &["display"]);
                if display.is_empty() {
                    str_at(a, &["reference"])
                } else {
                    display
                }
            })
            .unwrap_or_default();
        json!({
            "source": "DocumentReference",
            "type": concept_text(r.get("type")),
            "date": str_at(r, &["date"]),
            "status": str_at(r, &["status"]),
            "author": author,
            "sections": soap_sections(&text),
            "text": text,
        })
    });
    let reports = resources(bundle, "DiagnosticReport").map(|r| {
        let mut parts: Vec<String> = Vec::new();
        let conclusion = str_at(r, &["conclusion"]);
        if !conclusion.is_empty() {
            parts.push(conclusion.to_string());
        }
        parts.extend(
            r.get("presentedForm")
                .and_then(|p| p.as_array())
                .into_iter()
                .flatten()
                .map(attachment_text)
                .filter(|t| !t.is_empty()),
        );
        let date = match str_at(r, &["effectiveDateTime"]) {
            "" => str_at(r, &["issued"]),
            d => d,
        };
        let text = parts.join("\n");
        json!({
            "source": "DiagnosticReport",
            "type": concept_text(r.get("code")),
            "date": date,
            "status": str_at(r, &["status"]),
            "author": "",
            "sections": soap_sections(&text),
            "text": text,
        })
    });
    documents.chain(reports).collect()
}

pub fn has_category(obs: &Value, category: &str) -> bool {
    obs.get("category")
        .and_then(|c| c.as_array())
        .map(|c| c.iter().any(|x| x.as_str().map(|s| s.eq_ignore_ascii_case(category)).unwrap_or(false)))
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    /// 最小 FHIR Bundle：一位患者、一项诊断、两条观察、一条用药
    pub fn bundle(id: &str, gender: &str, birth: &str, condition: &str, hba1c: f64) -> Value {
        json!({
            "resourceType": "Bundle",
            "entry": [
                {"resource": {"resourceType": "Patient", "id": id, "gender": gender, "birthDate": birth,
                    "name": [{"given": ["Ann"], "family": "Lee"}]}},
                {"resource": {"resourceType": "Condition",
                    "code": {"text": condition},
                    "clinicalStatus": {"coding": [{"code": "active"}]},
                    "onsetDateTime": "2015-01-01"}},
                {"resource": {"resourceType": "Observation",
                    "category": [{"coding": [{"code": "laboratory"}]}],
                    "code": {"coding": [{"display": "Hemoglobin A1c"}]},
                    "valueQuantity": {"value": hba1c, "unit": "%"},
                    "effectiveDateTime": "2020-05-01"}},
                {"resource": {"resourceType": "Observation",
                    "category": [{"coding": [{"code": "vital-signs"}]}],
                    "code": {"text": "Heart rate"},
                    "valueQuantity": {"value": 72, "unit": "/min"}}},
                {"resource": {"resourceType": "MedicationRequest",
                    "medicationCodeableConcept": {"text": "Metformin 500 MG"},
                    "status": "active"}}
            ]
        })
    }

    pub fn write(dir: &std::path::Path, id: &str, bundle: &Value) {
        std::fs::write(dir.join(format!("{id}.json")), bundle.to_string()).unwrap();
    }
}
