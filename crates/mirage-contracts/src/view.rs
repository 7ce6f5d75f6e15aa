use serde::{Deserialize, Serialize};

use crate::artifacts::{GenerationMode, UploadedFileMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryAction {
    Generate,
    Regenerate,
}

impl PrimaryAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Generate => "Generate",
            Self::Regenerate => "Regenerate",
        }
    }
}

/// Derived snapshot handed to the rendering layer. Holds no truth of its
/// own; every field is recomputed from orchestrator state on each read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub active_mode: GenerationMode,
    pub prompt: String,
    pub ratio: String,
    pub is_public: bool,
    pub uploaded_file: Option<UploadedFileMeta>,
    pub selected_artifact_id: Option<String>,
    pub is_generating: bool,
    pub generation_progress: u8,
    pub error_message: Option<String>,
    pub credit_balance: u64,
    pub can_generate: bool,
    pub primary_action: PrimaryAction,
}
