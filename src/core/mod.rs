pub mod detector;
pub mod enrollment;
pub mod orchestrator;
pub mod poller;
pub mod recognition;

pub use detector::{BoundingBox, Descriptor, DetectedFace, FaceDetector, OnnxFaceDetector};
pub use enrollment::{EnrollmentSequencer, EnrollmentSession, StepOutcome, VariationCatalog};
pub use orchestrator::Orchestrator;
pub use poller::DetectionPoller;
pub use recognition::{
    AttemptTicket, AutoRecognition, ControllerHandles, Phase, RecognitionController, Transition,
};
