use async_trait::async_trait;

use crate::common::config::ServiceConfig;
use crate::common::error::{DoorError, Result};
use crate::service::protocol::{
    AddFaceEnvelope, AddFaceRequest, RecognizeEnvelope, RecognizeRequest,
};

/// Result of one recognition attempt as the controller consumes it.
///
/// Transport and parse failures are folded into `Unknown`; the controller
/// treats a failed call and an unrecognized face the same way.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Recognized {
        name: String,
        confidence: Option<f32>,
        distance: Option<f32>,
        threshold: Option<f32>,
        best_variation: Option<String>,
    },
    Unknown {
        message: Option<String>,
    },
}

impl AttemptOutcome {
    pub fn is_recognized(&self) -> bool {
        matches!(self, AttemptOutcome::Recognized { .. })
    }
}

#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    /// One recognition request. Never fails past this boundary.
    async fn recognize(&self, image_b64: &str) -> AttemptOutcome;

    /// Submit one enrollment capture. No automatic retry; failures surface
    /// to the caller, which may retry the same step.
    async fn add_face(&self, name: &str, image_b64: &str, variation_type: &str) -> Result<String>;
}

/// HTTP client for the recognition/enrollment backend.
pub struct HttpBackend {
    base_url: String,
    http: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn recognize_inner(&self, image_b64: &str) -> Result<RecognizeEnvelope> {
        let request = RecognizeRequest {
            image: image_b64.to_string(),
        };
        let envelope = self
            .http
            .post(self.endpoint("/faces/recognize"))
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<RecognizeEnvelope>()
            .await?;
        Ok(envelope)
    }
}

#[async_trait]
impl RecognitionBackend for HttpBackend {
    async fn recognize(&self, image_b64: &str) -> AttemptOutcome {
        let envelope = match self.recognize_inner(image_b64).await {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("recognition request failed: {e}");
                return AttemptOutcome::Unknown {
                    message: Some(e.to_string()),
                };
            }
        };

        if !envelope.success {
            return AttemptOutcome::Unknown {
                message: Some(envelope.message),
            };
        }

        match envelope.result {
            Some(result) if result.recognized => AttemptOutcome::Recognized {
                name: result.name.unwrap_or_else(|| "unknown".to_string()),
                confidence: result.confidence,
                distance: result.distance,
                threshold: result.threshold,
                best_variation: result.best_variation,
            },
            _ => AttemptOutcome::Unknown {
                message: Some(envelope.message),
            },
        }
    }

    async fn add_face(&self, name: &str, image_b64: &str, variation_type: &str) -> Result<String> {
        let request = AddFaceRequest {
            name: name.to_string(),
            image: image_b64.to_string(),
            variation_type: variation_type.to_string(),
        };

        let envelope = self
            .http
            .post(self.endpoint("/faces/add"))
            .json(&request)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| DoorError::Service(format!("enrollment upload rejected: {e}")))?
            .json::<AddFaceEnvelope>()
            .await
            .map_err(|e| DoorError::Service(format!("malformed enrollment response: {e}")))?;

        if envelope.success {
            Ok(envelope.message)
        } else {
            Err(DoorError::Service(envelope.message))
        }
    }
}
