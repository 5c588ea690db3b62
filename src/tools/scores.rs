//! 临床评分工具：calculate_score
//!
//! wells_dvt / wells_pe / chadsvasc / curb65 / meld / sofa / apache_ii。给出 patient_id 且为 chadsvasc 时，
//! 从患者记录（出生日期、性别、诊断关键词）自动提取危险因素；显式 parameters 优先覆盖。

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::ToolError;
use crate::tools::fhir::{self, FhirStore};
use crate::tools::schema::{parse_args, schema_value};
use crate::tools::Tool;

const DISCLAIMER: &str = "Clinical scores are decision support tools. Always use clinical judgment.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScoreType {
    WellsDvt,
    WellsPe,
    Chadsvasc,
    Curb65,
    Meld,
    Sofa,
    ApacheIi,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ScoreArgs {
    pub score_type: ScoreType,
    /// 从该患者记录提取危险因素（目前用于 chadsvasc）
    #[serde(default)]
    pub patient_id: Option<String>,
    /// 评分所需参数：布尔型危险因素，或数值型指标（MELD 的 creatinine / bilirubin / inr，
    /// SOFA 的 pao2_fio2 / platelets / gcs 等，APACHE II 的 age / acute_physiology_score）
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
}

fn flag(p: &Map<String, Value>, key: &str) -> bool {
    p.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn number(p: &Map<String, Value>, key: &str, default: f64) -> f64 {
    p.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

fn maybe(p: &Map<String, Value>, key: &str) -> Option<f64> {
    p.get(key).and_then(|v| v.as_f64())
}

pub fn wells_dvt(p: &Map<String, Value>) -> Value {
    let criteria = [
        "active_cancer",
        "paralysis_or_immobilization",
        "bedridden_or_surgery",
        "localized_tenderness",
        "leg_swelling",
        "calf_swelling_3cm",
        "pitting_edema",
        "collateral_veins",
        "previous_dvt",
    ];
    let mut score: i32 = criteria.iter().filter(|c| flag(p, c)).count() as i32;
    if flag(p, "alternative_diagnosis") {
        score -= 2;
    }
    let (risk, probability) = if score <= 0 {
        ("Low", "5%")
    } else if score <= 2 {
        ("Moderate", "17%")
    } else {
        ("High", "53%")
    };
    json!({
        "score_name": "Wells' Criteria for DVT",
        "score": score,
        "risk_category": risk,
        "dvt_probability": probability,
        "recommendation": format!("{risk} probability - consider D-dimer and/or ultrasound based on clinical judgment"),
    })
}

pub fn wells_pe(p: &Map<String, Value>) -> Value {
    let score: f64 = [
        ("dvt_signs", 3.0),
        ("pe_most_likely", 3.0),
        ("heart_rate_over_100", 1.5),
        ("immobilization_or_surgery", 1.5),
        ("previous_dvt_pe", 1.5),
        ("hemoptysis", 1.0),
        ("active_cancer", 1.0),
    ]
    .iter()
    .filter(|(key, _)| flag(p, key))
    .map(|(_, points)| points)
    .sum();
    let (risk, probability) = if score < 2.0 {
        ("Low", "1.3%")
    } else if score <= 6.0 {
        ("Moderate", "16.2%")
    } else {
        ("High", "37.5%")
    };
    let likely = score > 4.0;
    json!({
        "score_name": "Wells' Criteria for PE",
        "score": score,
        "risk_category": risk,
        "pe_probability": probability,
        "two_tier": if likely { "PE likely" } else { "PE unlikely" },
        "recommendation": if likely {
            "PE likely - proceed to CT pulmonary angiography"
        } else {
            "PE unlikely - D-dimer to rule out; image if elevated"
        },
    })
}

pub fn chadsvasc(p: &Map<String, Value>) -> Value {
    let mut score = 0;
    for (key, points) in [
        ("chf", 1),
        ("hypertension", 1),
        ("diabetes", 1),
        ("stroke_tia", 2),
        ("vascular_disease", 1),
        ("female", 1),
    ] {
        if flag(p, key) {
            score += points;
        }
    }
    if flag(p, "age_75_or_older") {
        score += 2;
    } else if flag(p, "age_65_to_74") {
        score += 1;
    }
    let (risk, recommendation) = match score {
        0 => ("Low", "No anticoagulation recommended"),
        1 => ("Low-Moderate", "Consider anticoagulation"),
        _ => ("Moderate-High", "Anticoagulation recommended"),
    };
    json!({
        "score_name": "CHA2DS2-VASc Score",
        "score": score,
        "risk_category": risk,
        "recommendation": recommendation,
    })
}

pub fn curb65(p: &Map<String, Value>) -> Value {
    let score = [
        "confusion",
        "urea_elevated",
        "respiratory_rate_30",
        "low_blood_pressure",
        "age_65_or_older",
    ]
    .iter()
    .filter(|c| flag(p, c))
    .count();
    let (risk, mortality, recommendation) = match score {
        0 | 1 => ("Low", "1.5%", "Consider outpatient treatment"),
        2 => ("Moderate", "9.2%", "Consider short inpatient stay or closely supervised outpatient"),
        _ => ("High", "22%", "Hospitalize, consider ICU if score 4-5"),
    };
    json!({
        "score_name": "CURB-65 Pneumonia Severity",
        "score": score,
        "risk_category": risk,
        "30_day_mortality": mortality,
        "recommendation": recommendation,
    })
}

pub fn meld(p: &Map<String, Value>) -> Value {
    let mut creatinine = number(p, "creatinine", 1.0).clamp(1.0, 4.0);
    if flag(p, "dialysis") {
        creatinine = 4.0;
    }
    let bilirubin = number(p, "bilirubin", 1.0).max(1.0);
    let inr = number(p, "inr", 1.0).max(1.0);
    let raw = (0.957 * creatinine.ln() + 0.378 * bilirubin.ln() + 1.120 * inr.ln() + 0.643) * 10.0;
    let score = (raw.round() as i64).clamp(6, 40);
    let mortality = match score {
        s if s < 10 => "1.9%",
        s if s < 20 => "6.0%",
        s if s < 30 => "19.6%",
        s if s < 40 => "52.6%",
        _ => "71.3%",
    };
    json!({
        "score_name": "MELD Score",
        "score": score,
        "3_month_mortality": mortality,
        "note": "Higher scores indicate more urgent need for transplant",
    })
}

/// 按阈值表取分：首个满足 `value < bound` 的档位
fn banded(value: f64, bands: &[(f64, i64)], top: i64) -> i64 {
    bands
        .iter()
        .find(|(bound, _)| value < *bound)
        .map(|(_, points)| *points)
        .unwrap_or(top)
}

fn sofa_respiration(p: &Map<String, Value>) -> i64 {
    let Some(ratio) = maybe(p, "pao2_fio2") else { return 0 };
    let points = banded(ratio, &[(100.0, 4), (200.0, 3), (300.0, 2), (400.0, 1)], 0);
    // 3 / 4 分要求机械通气
    if flag(p, "mechanical_ventilation") {
        points
    } else {
        points.min(2)
    }
}

fn sofa_cardiovascular(p: &Map<String, Value>) -> i64 {
    let dopamine = number(p, "dopamine", 0.0);
    let epinephrine = number(p, "epinephrine", 0.0);
    let norepinephrine = number(p, "norepinephrine", 0.0);
    if dopamine > 15.0 || epinephrine > 0.1 || norepinephrine > 0.1 {
        4
    } else if dopamine > 5.0 || epinephrine > 0.0 || norepinephrine > 0.0 {
        3
    } else if dopamine > 0.0 || flag(p, "dobutamine") {
        2
    } else if maybe(p, "mean_arterial_pressure").is_some_and(|map| map < 70.0) {
        1
    } else {
        0
    }
}

fn sofa_renal(p: &Map<String, Value>) -> i64 {
    let by_creatinine = maybe(p, "creatinine")
        .map(|cr| banded(cr, &[(1.2, 0), (2.0, 1), (3.5, 2), (5.0, 3)], 4))
        .unwrap_or(0);
    let by_urine = match maybe(p, "urine_output") {
        Some(ml) if ml < 200.0 => 4,
        Some(ml) if ml < 500.0 => 3,
        _ => 0,
    };
    by_creatinine.max(by_urine)
}

/// SOFA：六个器官系统各 0-4 分；缺失的指标按正常计 0 分
pub fn sofa(p: &Map<String, Value>) -> Value {
    let components = json!({
        "respiration": sofa_respiration(p),
        "coagulation": maybe(p, "platelets")
            .map(|v| banded(v, &[(20.0, 4), (50.0, 3), (100.0, 2), (150.0, 1)], 0))
            .unwrap_or(0),
        "liver": maybe(p, "bilirubin")
            .map(|v| banded(v, &[(1.2, 0), (2.0, 1), (6.0, 2), (12.0, 3)], 4))
            .unwrap_or(0),
        "cardiovascular": sofa_cardiovascular(p),
        "cns": maybe(p, "gcs")
            .map(|v| banded(v, &[(6.0, 4), (10.0, 3), (13.0, 2), (15.0, 1)], 0))
            .unwrap_or(0),
        "renal": sofa_renal(p),
    });
    let score: i64 = components
        .as_object()
        .map(|c| c.values().filter_map(Value::as_i64).sum())
        .unwrap_or(0);
    let (risk, mortality) = match score {
        0..=6 => ("Low", "<10%"),
        7..=9 => ("Moderate", "15-20%"),
        10..=12 => ("High", "40-50%"),
        13..=14 => ("Very High", "50-60%"),
        _ => ("Critical", ">80%"),
    };
    json!({
        "score_name": "SOFA Score",
        "score": score,
        "components": components,
        "risk_category": risk,
        "icu_mortality": mortality,
        "recommendation": "Track serially; an increase of 2 or more points suggests organ dysfunction from infection",
    })
}

/// APACHE II：acute_physiology_score 为 12 项生理指标评分之和（不含 GCS），
/// 另加 15 - gcs、年龄分与慢性健康分
pub fn apache_ii(p: &Map<String, Value>) -> Value {
    let aps = number(p, "acute_physiology_score", 0.0).max(0.0) as i64;
    let gcs_points = maybe(p, "gcs").map(|g| 15 - g.clamp(3.0, 15.0) as i64).unwrap_or(0);
    let age_points = banded(number(p, "age", 0.0), &[(45.0, 0), (55.0, 2), (65.0, 3), (75.0, 5)], 6);
    let chronic_points = if !flag(p, "chronic_organ_insufficiency") {
        0
    } else if flag(p, "elective_postoperative") {
        2
    } else {
        5
    };
    let score = aps + gcs_points + age_points + chronic_points;
    let (risk, mortality) = match score {
        0..=4 => ("Low", "~4%"),
        5..=9 => ("Low", "~8%"),
        10..=14 => ("Moderate", "~15%"),
        15..=19 => ("Moderate", "~25%"),
        20..=24 => ("High", "~40%"),
        25..=29 => ("High", "~55%"),
        30..=34 => ("Very High", "~75%"),
        _ => ("Very High", "~85%"),
    };
    json!({
        "score_name": "APACHE II Score",
        "score": score,
        "components": {
            "acute_physiology": aps + gcs_points,
            "age": age_points,
            "chronic_health": chronic_points,
        },
        "risk_category": risk,
        "hospital_mortality": mortality,
        "recommendation": "Use for ICU severity stratification within the first 24 hours of admission",
    })
}

/// 截至 today 的周岁
pub fn age_on(birth_date: &str, today: NaiveDate) -> Option<i32> {
    let birth = NaiveDate::parse_from_str(birth_date.get(..10).unwrap_or(birth_date), "%Y-%m-%d").ok()?;
    let mut age = today.year() - birth.year();
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    Some(age)
}

const CHADSVASC_KEYWORDS: &[(&str, &[&str])] = &[
    ("chf", &["heart failure"]),
    ("hypertension", &["hypertension", "hypertensive"]),
    ("diabetes", &["diabetes", "diabetic"]),
    (
        "stroke_tia",
        &["stroke", "transient ischemic attack", "cerebral infarction", "cerebrovascular accident", "cerebral embolism"],
    ),
    (
        "vascular_disease",
        &["myocardial infarction", "coronary", "peripheral arter", "atherosclerosis", "ischemic heart disease"],
    ),
];

/// 由患者记录推导 CHA2DS2-VASc 危险因素
pub fn chadsvasc_factors(bundle: &Value, today: NaiveDate) -> Map<String, Value> {
    let mut p = Map::new();
    let demo = fhir::demographics(bundle).unwrap_or(Value::Null);
    let age = demo
        .get("birth_date")
        .and_then(|b| b.as_str())
        .and_then(|b| age_on(b, today))
        .unwrap_or(0);
    p.insert("age_75_or_older".into(), json!(age >= 75));
    p.insert("age_65_to_74".into(), json!((65..75).contains(&age)));
    let female = demo
        .get("gender")
        .and_then(|g| g.as_str())
        .map(|g| g.eq_ignore_ascii_case("female"))
        .unwrap_or(false);
    p.insert("female".into(), json!(female));

    let names: Vec<String> = fhir::conditions(bundle)
        .iter()
        .filter_map(|c| c.get("name").and_then(|n| n.as_str()).map(str::to_lowercase))
        .collect();
    for (factor, keywords) in CHADSVASC_KEYWORDS {
        let hit = names.iter().any(|n| keywords.iter().any(|k| n.contains(k)));
        p.insert((*factor).to_string(), json!(hit));
    }
    p
}

pub struct ClinicalScoreTool {
    store: FhirStore,
}

impl ClinicalScoreTool {
    pub fn new(store: FhirStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ClinicalScoreTool {
    fn name(&self) -> &str {
        "calculate_score"
    }

    fn description(&self) -> &str {
        "Calculate a clinical risk score (wells_dvt, wells_pe, chadsvasc, curb65, meld, sofa, apache_ii) from explicit parameters. \
         With patient_id and chadsvasc, risk factors are extracted from the patient's record."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<ScoreArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: ScoreArgs = parse_args(args)?;
        let mut params = Map::new();
        let mut extracted = None;

        if let Some(pid) = &args.patient_id {
            if args.score_type == ScoreType::Chadsvasc {
                let bundle = self.store.load_bundle(pid)?;
                let factors = chadsvasc_factors(&bundle, Utc::now().date_naive());
                extracted = Some(Value::Object(factors.clone()));
                params = factors;
            }
        }
        if let Some(explicit) = args.parameters {
            params.extend(explicit);
        }

        tracing::info!(score_type = ?args.score_type, patient_id = ?args.patient_id, "calculate_score tool execute");
        let mut result = match args.score_type {
            ScoreType::WellsDvt => wells_dvt(&params),
            ScoreType::WellsPe => wells_pe(&params),
            ScoreType::Chadsvasc => chadsvasc(&params),
            ScoreType::Curb65 => curb65(&params),
            ScoreType::Meld => meld(&params),
            ScoreType::Sofa => sofa(&params),
            ScoreType::ApacheIi => apache_ii(&params),
        };
        if let Value::Object(obj) = &mut result {
            if let Some(pid) = args.patient_id {
                obj.insert("patient_id".into(), json!(pid));
            }
            if let Some(f) = extracted {
                obj.insert("extracted_factors".into(), f);
            }
            obj.insert("disclaimer".into(), json!(DISCLAIMER));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fhir::fixtures;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_wells_bands() {
        assert_eq!(wells_dvt(&params(json!({})))["risk_category"], "Low");
        let moderate = wells_dvt(&params(json!({"active_cancer": true, "leg_swelling": true})));
        assert_eq!(moderate["score"], 2);
        assert_eq!(moderate["dvt_probability"], "17%");
        let with_alt = wells_dvt(&params(json!({
            "active_cancer": true, "leg_swelling": true, "pitting_edema": true, "alternative_diagnosis": true
        })));
        assert_eq!(with_alt["score"], 1);
    }

    #[test]
    fn test_chadsvasc_age_and_stroke_points() {
        let r = chadsvasc(&params(json!({"age_75_or_older": true, "stroke_tia": true, "female": true})));
        assert_eq!(r["score"], 5);
        assert_eq!(r["risk_category"], "Moderate-High");
        assert_eq!(chadsvasc(&params(json!({"hypertension": true})))["risk_category"], "Low-Moderate");
    }

    #[test]
    fn test_curb65_bands() {
        assert_eq!(curb65(&params(json!({"confusion": true})))["30_day_mortality"], "1.5%");
        let high = curb65(&params(json!({"confusion": true, "urea_elevated": true, "age_65_or_older": true})));
        assert_eq!(high["risk_category"], "High");
    }

    #[test]
    fn test_meld_clamps() {
        assert_eq!(meld(&params(json!({})))["score"], 6);
        // cr 4 (dialysis), bili 3, inr 2 → round(10 * (1.3267 + 0.4153 + 0.7763 + 0.643)) = 32
        let r = meld(&params(json!({"creatinine": 1.2, "dialysis": true, "bilirubin": 3.0, "inr": 2.0})));
        assert_eq!(r["score"], 32);
        assert_eq!(r["3_month_mortality"], "52.6%");
    }

    #[test]
    fn test_wells_pe_tiers() {
        assert_eq!(wells_pe(&params(json!({})))["two_tier"], "PE unlikely");
        let r = wells_pe(&params(json!({"dvt_signs": true, "heart_rate_over_100": true})));
        assert_eq!(r["score"], 4.5);
        assert_eq!(r["risk_category"], "Moderate");
        assert_eq!(r["two_tier"], "PE likely");
        let high = wells_pe(&params(json!({"dvt_signs": true, "pe_most_likely": true, "hemoptysis": true})));
        assert_eq!(high["risk_category"], "High");
    }

    #[test]
    fn test_sofa_components() {
        assert_eq!(sofa(&params(json!({})))["score"], 0);
        let r = sofa(&params(json!({
            "pao2_fio2": 150, "mechanical_ventilation": true,
            "platelets": 90, "bilirubin": 2.5, "norepinephrine": 0.05,
            "gcs": 14, "creatinine": 1.0, "urine_output": 400
        })));
        assert_eq!(r["components"]["respiration"], 3);
        assert_eq!(r["components"]["coagulation"], 2);
        assert_eq!(r["components"]["liver"], 2);
        assert_eq!(r["components"]["cardiovascular"], 3);
        assert_eq!(r["components"]["cns"], 1);
        assert_eq!(r["components"]["renal"], 3);
        assert_eq!(r["score"], 14);
        assert_eq!(r["risk_category"], "Very High");
        // 无机械通气时呼吸分封顶 2
        assert_eq!(sofa(&params(json!({"pao2_fio2": 80})))["components"]["respiration"], 2);
    }

    #[test]
    fn test_apache_ii_sums_parts() {
        let r = apache_ii(&params(json!({
            "acute_physiology_score": 10, "gcs": 12, "age": 70, "chronic_organ_insufficiency": true
        })));
        assert_eq!(r["components"]["acute_physiology"], 13);
        assert_eq!(r["components"]["age"], 5);
        assert_eq!(r["components"]["chronic_health"], 5);
        assert_eq!(r["score"], 23);
        assert_eq!(r["hospital_mortality"], "~40%");
        let elective = apache_ii(&params(json!({
            "age": 40, "chronic_organ_insufficiency": true, "elective_postoperative": true
        })));
        assert_eq!(elective["score"], 2);
    }

    #[test]
    fn test_chadsvasc_factors_from_record() {
        let b = fixtures::bundle("p1", "female", "1940-06-15", "Essential hypertension", 6.0);
        let today = NaiveDate::from_ymd_opt(2020, 6, 14).unwrap();
        let f = chadsvasc_factors(&b, today);
        assert_eq!(f["age_75_or_older"], true);
        assert_eq!(f["hypertension"], true);
        assert_eq!(f["diabetes"], false);
        assert_eq!(chadsvasc(&f)["score"], 4);
        assert_eq!(age_on("1940-06-15", today), Some(79));
    }

    #[tokio::test]
    async fn test_tool_merges_explicit_parameters() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write(dir.path(), "p1", &fixtures::bundle("p1", "male", "2000-01-01", "Asthma", 6.0));
        let tool = ClinicalScoreTool::new(FhirStore::new(dir.path()));
        let out = tool
            .execute(json!({"score_type": "chadsvasc", "patient_id": "p1", "parameters": {"chf": true}}))
            .await
            .unwrap();
        assert_eq!(out["score"], 1);
        assert_eq!(out["extracted_factors"]["chf"], false);
        assert!(out["disclaimer"].is_string());
    }
}
