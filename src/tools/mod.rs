pub mod discovery;
pub mod executor;
pub mod fhir;
pub mod imaging;
pub mod patient_data;
pub mod registry;
pub mod schema;
pub mod scores;
pub mod search;

pub use discovery::SampleRecordsTool;
pub use executor::ToolExecutor;
pub use fhir::{DataRoot, FhirStore};
pub use imaging::AnalyzeImageTool;
pub use patient_data::{ListPatientsTool, PatientDataTool};
pub use registry::{Tool, ToolRegistry};
pub use scores::ClinicalScoreTool;
pub use search::SearchPatientsTool;

use std::path::Path;
use std::sync::Arc;

use crate::core::AgentError;
use crate::llm::LlmClient;

/// 创建默认临床工具集：list_patients、sample_records、get_patient_data、search_patients、calculate_score、analyze_image
pub fn create_default_registry(
    fhir_root: impl AsRef<Path>,
    image_root: impl AsRef<Path>,
    llm: Arc<dyn LlmClient>,
) -> Result<ToolRegistry, AgentError> {
    let store = FhirStore::new(fhir_root);
    let mut registry = ToolRegistry::new();
    registry.register(ListPatientsTool::new(store.clone()))?;
    registry.register(SampleRecordsTool::new(store.clone()))?;
    registry.register(PatientDataTool::new(store.clone()))?;
    registry.register(SearchPatientsTool::new(store.clone()))?;
    registry.register(ClinicalScoreTool::new(store))?;
    registry.register(AnalyzeImageTool::new(image_root, llm))?;
    Ok(registry)
}
