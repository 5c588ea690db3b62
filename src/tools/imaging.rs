//! 影像分析工具：analyze_image（专科远程分析工具）
//!
//! 读取 `image_root/<patient_id>/` 下与 image_type 匹配的 PNG/JPEG，base64 内联后
//! 通过同一个带重试的推理网关请求多模态分析。

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::ToolError;
use crate::llm::{ImageAttachment, LlmClient, LlmRequest, Message, RequestPurpose};
use crate::tools::fhir::{check_patient_id, DataRoot};
use crate::tools::schema::{parse_args, schema_value};
use crate::tools::Tool;

const MAX_IMAGES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Dicom,
    Ecg,
    Xray,
}

impl ImageType {
    fn as_str(&self) -> &'static str {
        match self {
            ImageType::Dicom => "dicom",
            ImageType::Ecg => "ecg",
            ImageType::Xray => "xray",
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ImageArgs {
    pub patient_id: String,
    pub image_type: ImageType,
    /// 需要回答的临床问题
    #[serde(default)]
    pub clinical_question: Option<String>,
}

fn media_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "image/png",
    }
}

pub struct AnalyzeImageTool {
    images: DataRoot,
    llm: Arc<dyn LlmClient>,
}

impl AnalyzeImageTool {
    pub fn new(image_root: impl AsRef<Path>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            images: DataRoot::new(image_root),
            llm,
        }
    }
}

#[async_trait]
impl Tool for AnalyzeImageTool {
    fn name(&self) -> &str {
        "analyze_image"
    }

    fn description(&self) -> &str {
        "Specialist remote vision analysis of a patient's medical images (dicom, ecg, xray). \
         Sends the images to a multimodal model together with the clinical question."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<ImageArgs>()
    }

    fn is_specialist(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: ImageArgs = parse_args(args)?;
        let pid = check_patient_id(&args.patient_id)?;
        let kind = args.image_type.as_str();
        let files = self.images.files_in(pid, &["png", "jpg", "jpeg"])?;
        let selected: Vec<_> = files
            .iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.to_lowercase().contains(kind))
                    .unwrap_or(false)
            })
            .take(MAX_IMAGES)
            .collect();
        if selected.is_empty() {
            let available: Vec<String> = files
                .iter()
                .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
                .collect();
            return Err(ToolError::missing_data(format!(
                "No {kind} images for patient {pid}; available files: {available:?}"
            )));
        }

        let mut attachments = Vec::with_capacity(selected.len());
        let mut names = Vec::with_capacity(selected.len());
        for path in &selected {
            let bytes = std::fs::read(path)
                .map_err(|e| ToolError::execution_failed(format!("Read failed: {e}")))?;
            attachments.push(ImageAttachment {
                media_type: media_type(path).to_string(),
                data_base64: STANDARD.encode(bytes),
            });
            if let Some(n) = path.file_name().and_then(|n| n.to_str()) {
                names.push(n.to_string());
            }
        }

        let question = args
            .clinical_question
            .clone()
            .unwrap_or_else(|| format!("Describe clinically relevant findings in this {kind} study."));
        let request = LlmRequest::new(
            RequestPurpose::ImageAnalysis,
            vec![
                Message::system(crate::react::prompts::IMAGE_ANALYSIS_SYSTEM),
                Message::user(format!(
                    "Patient: {pid}\nImage type: {kind}\nImages: {}\nQuestion: {question}",
                    names.join(", ")
                )),
            ],
        )
        .with_images(attachments);

        tracing::info!(patient_id = %pid, image_type = kind, images = names.len(), "analyze_image tool execute");
        let analysis = self
            .llm
            .complete(&request)
            .await
            .map_err(|e| ToolError::execution_failed(format!("Image analysis failed: {e}")))?
            .into_text();

        Ok(json!({
            "patient_id": pid,
            "image_type": kind,
            "images_analyzed": names.len(),
            "files": names,
            "analysis": analysis,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, MockLlmClient};

    #[tokio::test]
    async fn test_sends_matching_images_inline() {
        let dir = tempfile::tempdir().unwrap();
        let pdir = dir.path().join("p1");
        std::fs::create_dir(&pdir).unwrap();
        std::fs::write(pdir.join("ecg_1.png"), [0x89, b'P', b'N', b'G']).unwrap();
        std::fs::write(pdir.join("xray_1.jpg"), [0xff, 0xd8]).unwrap();

        let mock = Arc::new(MockLlmClient::new().with(
            RequestPurpose::ImageAnalysis,
            LlmResponse::Text("Sinus rhythm".into()),
        ));
        let tool = AnalyzeImageTool::new(dir.path(), mock.clone());
        let out = tool
            .execute(json!({"patient_id": "p1", "image_type": "ecg"}))
            .await
            .unwrap();
        assert_eq!(out["analysis"], "Sinus rhythm");
        assert_eq!(out["files"], json!(["ecg_1.png"]));

        let sent = mock.requests();
        assert_eq!(sent[0].images.len(), 1);
        assert_eq!(sent[0].images[0].media_type, "image/png");
    }

    #[tokio::test]
    async fn test_missing_images_is_missing_data() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("p1")).unwrap();
        let tool = AnalyzeImageTool::new(dir.path(), Arc::new(MockLlmClient::new()));
        let err = tool
            .execute(json!({"patient_id": "p1", "image_type": "xray"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::core::ToolErrorKind::MissingData);
    }
}
