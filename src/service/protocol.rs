use serde::{Deserialize, Serialize};

// Wire types for the recognition/enrollment backend. Field names follow the
// backend's snake_case JSON exactly.

#[derive(Serialize, Debug, Clone)]
pub struct RecognizeRequest {
    /// Base64-encoded JPEG still.
    pub image: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RecognizeEnvelope {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result: Option<RecognitionResult>,
}

/// Outcome of a single recognition attempt, owned transiently by its caller.
#[derive(Deserialize, Debug, Clone)]
pub struct RecognitionResult {
    pub recognized: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub distance: Option<f32>,
    #[serde(default)]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub best_variation: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct AddFaceRequest {
    pub name: String,
    /// Base64-encoded JPEG still.
    pub image: String,
    pub variation_type: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AddFaceEnvelope {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}
