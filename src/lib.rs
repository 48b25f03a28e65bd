// Core modules
pub mod camera;
pub mod common;
pub mod core;
pub mod events;
pub mod service;

// Re-export commonly used types
pub use camera::{CameraDevice, CameraManager, CapturedFrame, FrameSource};
pub use common::{Config, DoorError, Result};
pub use core::{
    AutoRecognition, DetectedFace, DetectionPoller, EnrollmentSequencer, FaceDetector,
    OnnxFaceDetector, Orchestrator, Phase, RecognitionController, StepOutcome, VariationCatalog,
};
pub use events::{DoorEvent, EventBus, PendingUnlock, UnlockLatch};
pub use service::{AttemptOutcome, HttpBackend, RecognitionBackend};
