use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    Text,
    Image,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "txt" | "txt2img" | "text2img" => Some(Self::Text),
            "image" | "img" | "img2img" | "image2img" => Some(Self::Image),
            _ => None,
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::Text => Self::Image,
            Self::Image => Self::Text,
        }
    }
}

pub const ALLOWED_RATIOS: &[&str] = &["1:1", "4:3", "3:4", "16:9", "9:16"];
pub const DEFAULT_RATIO: &str = "1:1";

/// Canonicalize a user-supplied aspect ratio against the fixed product list.
pub fn normalize_ratio(value: &str) -> Option<&'static str> {
    let trimmed = value.trim().replace('x', ":");
    ALLOWED_RATIOS
        .iter()
        .find(|candidate| **candidate == trimmed)
        .copied()
}

pub fn ratio_dims(ratio: &str) -> Option<(u32, u32)> {
    let (w, h) = ratio.trim().split_once(':')?;
    let w = w.trim().parse::<u32>().ok().filter(|value| *value > 0)?;
    let h = h.trim().parse::<u32>().ok().filter(|value| *value > 0)?;
    Some((w, h))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub id: String,
    pub source_mode: GenerationMode,
    pub image_url: String,
    pub thumbnail_url: String,
    pub prompt: Option<String>,
    #[serde(default = "default_ratio")]
    pub ratio: String,
    #[serde(default)]
    pub is_public: bool,
    pub created_at: String,
}

fn default_ratio() -> String {
    DEFAULT_RATIO.to_string()
}

impl GeneratedArtifact {
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let id = non_empty_str(obj.get("id"))?;
        let source_mode = obj
            .get("source_mode")
            .or_else(|| obj.get("mode"))
            .and_then(Value::as_str)
            .and_then(GenerationMode::parse)
            .unwrap_or(GenerationMode::Text);
        let image_url = non_empty_str(obj.get("image_url"))?;
        Some(Self {
            id,
            source_mode,
            thumbnail_url: non_empty_str(obj.get("thumbnail_url")).unwrap_or_else(|| image_url.clone()),
            image_url,
            prompt: non_empty_str(obj.get("prompt")),
            ratio: non_empty_str(obj.get("ratio")).unwrap_or_else(|| DEFAULT_RATIO.to_string()),
            is_public: obj.get("is_public").and_then(Value::as_bool).unwrap_or(false),
            created_at: non_empty_str(obj.get("created_at")).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleArtifact {
    pub id: String,
    pub image_url: String,
    pub color_variant_url: String,
    pub descriptor: String,
}

impl ExampleArtifact {
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let id = non_empty_str(obj.get("id"))?;
        let image_url = non_empty_str(obj.get("image_url"))?;
        Some(Self {
            id,
            color_variant_url: non_empty_str(obj.get("color_variant_url"))
                .unwrap_or_else(|| image_url.clone()),
            image_url,
            descriptor: non_empty_str(obj.get("descriptor")).unwrap_or_default(),
        })
    }
}

/// An image the user attached for image-to-image generation. The bytes live
/// in memory for the lifetime of the form; views get the cheap metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            bytes,
        }
    }

    pub fn meta(&self) -> UploadedFileMeta {
        UploadedFileMeta {
            name: self.name.clone(),
            mime: self.mime.clone(),
            size_bytes: self.bytes.len() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFileMeta {
    pub name: String,
    pub mime: String,
    pub size_bytes: u64,
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
