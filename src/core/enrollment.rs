use std::sync::Arc;

use tokio::sync::watch;

use crate::camera::FrameSource;
use crate::common::config::EnrollmentConfig;
use crate::common::error::{DoorError, Result};
use crate::core::detector::DetectedFace;
use crate::events::{DoorEvent, EventBus};
use crate::service::RecognitionBackend;

/// Fixed ordered sequence of named capture profiles, shared by all sessions.
#[derive(Debug, Clone)]
pub struct VariationCatalog {
    entries: Vec<String>,
}

impl VariationCatalog {
    pub fn new(entries: Vec<String>) -> Result<Self> {
        if entries.is_empty() {
            return Err(DoorError::Config("variation catalog is empty".into()));
        }
        for entry in &entries {
            if entry.is_empty()
                || !entry
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(DoorError::Config(format!(
                    "variation name '{entry}' may only contain letters, digits and underscore"
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

impl Default for VariationCatalog {
    fn default() -> Self {
        Self {
            entries: EnrollmentConfig::default().variations,
        }
    }
}

/// Progress of one person's enrollment. Exists only while the flow is in
/// progress; nothing is persisted here.
#[derive(Debug, Clone)]
pub struct EnrollmentSession {
    person_name: String,
    catalog_index: usize,
    captured_variations: Vec<String>,
}

impl EnrollmentSession {
    fn new(person_name: String) -> Self {
        Self {
            person_name,
            catalog_index: 0,
            captured_variations: Vec::new(),
        }
    }

    pub fn person_name(&self) -> &str {
        &self.person_name
    }

    pub fn catalog_index(&self) -> usize {
        self.catalog_index
    }

    pub fn captured_variations(&self) -> &[String] {
        &self.captured_variations
    }
}

/// Result of one successful capture step.
#[derive(Debug)]
pub enum StepOutcome {
    Advanced {
        variation: String,
        index: usize,
        total: usize,
        /// Set after the first (default-profile) capture when policy says a
        /// full multi-variation session should be offered. Surfaced only;
        /// the caller decides.
        offer_full_session: bool,
    },
    Completed {
        name: String,
        captured: Vec<String>,
    },
}

/// Steps a named subject through the variation catalog, one reference
/// capture per entry.
pub struct EnrollmentSequencer {
    catalog: VariationCatalog,
    frames: Arc<dyn FrameSource>,
    faces: watch::Receiver<Vec<DetectedFace>>,
    backend: Arc<dyn RecognitionBackend>,
    events: EventBus,
    prompt_full_session: bool,
    session: Option<EnrollmentSession>,
}

impl EnrollmentSequencer {
    pub fn new(
        config: &EnrollmentConfig,
        frames: Arc<dyn FrameSource>,
        faces: watch::Receiver<Vec<DetectedFace>>,
        backend: Arc<dyn RecognitionBackend>,
        events: EventBus,
    ) -> Result<Self> {
        Ok(Self {
            catalog: VariationCatalog::new(config.variations.clone())?,
            frames,
            faces,
            backend,
            events,
            prompt_full_session: config.prompt_full_session,
            session: None,
        })
    }

    pub fn catalog(&self) -> &VariationCatalog {
        &self.catalog
    }

    pub fn session(&self) -> Option<&EnrollmentSession> {
        self.session.as_ref()
    }

    /// Begin a fresh session for `name`, replacing any session in progress.
    pub fn start_session(&mut self, name: &str) -> Result<()> {
        let name = name.trim();
        validate_person_name(name)?;
        self.session = Some(EnrollmentSession::new(name.to_string()));
        Ok(())
    }

    /// The catalog entry the next capture will record, if a session is open.
    pub fn current_variation(&self) -> Option<&str> {
        let session = self.session.as_ref()?;
        self.catalog.get(session.catalog_index)
    }

    /// Whether any face is currently visible to the detection poller.
    pub fn face_present(&self) -> bool {
        !self.faces.borrow().is_empty()
    }

    /// Capture and submit the current catalog entry.
    ///
    /// On success the session advances by exactly one step. On any failure
    /// the session is left exactly where it was (no skip, no data loss) and
    /// the caller may retry.
    pub async fn capture_current(&mut self) -> Result<StepOutcome> {
        let session = self.session.as_ref().ok_or(DoorError::NoSession)?;
        let variation = self
            .catalog
            .get(session.catalog_index)
            .ok_or(DoorError::NoSession)?
            .to_string();

        if !self.frames.is_streaming() {
            return Err(DoorError::NotStreaming);
        }
        if !self.face_present() {
            return Err(DoorError::NoFaceDetected);
        }
        let frame = self
            .frames
            .capture_frame()
            .ok_or(DoorError::FrameUnavailable)?;
        let image = frame.to_base64_jpeg()?;

        let name = session.person_name().to_string();
        let message = self.backend.add_face(&name, &image, &variation).await?;
        tracing::info!("captured '{variation}' for {name}: {message}");

        let session = self.session.as_mut().ok_or(DoorError::NoSession)?;
        session.captured_variations.push(variation.clone());
        session.catalog_index += 1;

        let index = session.catalog_index;
        let total = self.catalog.len();
        self.events.publish(DoorEvent::EnrollmentCaptured {
            variation: variation.clone(),
            index,
            total,
        });

        if index == total {
            let done = self.session.take().ok_or(DoorError::NoSession)?;
            self.events.publish(DoorEvent::EnrollmentCompleted {
                name: done.person_name.clone(),
                captured: done.captured_variations.clone(),
            });
            Ok(StepOutcome::Completed {
                name: done.person_name,
                captured: done.captured_variations,
            })
        } else {
            Ok(StepOutcome::Advanced {
                variation,
                index,
                total,
                offer_full_session: self.prompt_full_session && index == 1,
            })
        }
    }

    /// Abandon the session at its current index. Partial completion is a
    /// valid terminal state; the steps already uploaded stand.
    pub fn cancel(&mut self) -> Option<EnrollmentSession> {
        let session = self.session.take()?;
        self.events.publish(DoorEvent::EnrollmentCancelled {
            name: session.person_name.clone(),
            captured: session.captured_variations.len(),
        });
        Some(session)
    }
}

fn validate_person_name(name: &str) -> Result<()> {
    if name.chars().count() < 2 {
        return Err(DoorError::InvalidName(
            "name must be at least 2 characters".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c.is_whitespace() || c == '_')
    {
        return Err(DoorError::InvalidName(format!(
            "'{name}' contains invalid characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use image::DynamicImage;

    use crate::camera::CapturedFrame;
    use crate::core::detector::BoundingBox;
    use crate::service::AttemptOutcome;

    struct StubFrames {
        streaming: AtomicBool,
    }

    impl StubFrames {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                streaming: AtomicBool::new(true),
            })
        }
    }

    impl FrameSource for StubFrames {
        fn is_streaming(&self) -> bool {
            self.streaming.load(Ordering::SeqCst)
        }

        fn capture_frame(&self) -> Option<CapturedFrame> {
            self.is_streaming()
                .then(|| CapturedFrame::new(DynamicImage::new_luma8(16, 16)))
        }
    }

    struct StubBackend {
        uploads: Mutex<Vec<(String, String)>>,
        fail_next: AtomicBool,
    }

    impl StubBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                uploads: Mutex::new(Vec::new()),
                fail_next: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl RecognitionBackend for StubBackend {
        async fn recognize(&self, _image: &str) -> AttemptOutcome {
            AttemptOutcome::Unknown { message: None }
        }

        async fn add_face(
            &self,
            name: &str,
            _image: &str,
            variation_type: &str,
        ) -> Result<String> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(DoorError::Service("upload failed".into()));
            }
            self.uploads
                .lock()
                .unwrap()
                .push((name.to_string(), variation_type.to_string()));
            Ok("ok".into())
        }
    }

    fn faces_channel(present: bool) -> (watch::Sender<Vec<DetectedFace>>, watch::Receiver<Vec<DetectedFace>>) {
        let faces = if present {
            vec![DetectedFace {
                bbox: BoundingBox {
                    x1: 0.0,
                    y1: 0.0,
                    x2: 10.0,
                    y2: 10.0,
                },
                confidence: 0.9,
                descriptor: vec![0.0; 128],
            }]
        } else {
            Vec::new()
        };
        watch::channel(faces)
    }

    fn sequencer(
        frames: Arc<StubFrames>,
        backend: Arc<StubBackend>,
        faces: watch::Receiver<Vec<DetectedFace>>,
    ) -> EnrollmentSequencer {
        EnrollmentSequencer::new(
            &EnrollmentConfig::default(),
            frames,
            faces,
            backend,
            EventBus::new(),
        )
        .unwrap()
    }

    fn assert_invariant(seq: &EnrollmentSequencer) {
        if let Some(session) = seq.session() {
            assert_eq!(session.captured_variations().len(), session.catalog_index());
            assert!(session.catalog_index() <= seq.catalog().len());
        }
    }

    #[tokio::test]
    async fn full_session_captures_catalog_in_order() {
        let frames = StubFrames::new();
        let backend = StubBackend::new();
        let (_tx, rx) = faces_channel(true);
        let mut seq = sequencer(frames, backend.clone(), rx);

        seq.start_session("alice").unwrap();
        assert_eq!(seq.current_variation(), Some("default"));

        let mut completed = None;
        for _ in 0..7 {
            assert_invariant(&seq);
            match seq.capture_current().await.unwrap() {
                StepOutcome::Advanced { .. } => {}
                StepOutcome::Completed { name, captured } => {
                    completed = Some((name, captured));
                }
            }
        }

        let (name, captured) = completed.expect("session should complete on the 7th capture");
        assert_eq!(name, "alice");
        assert_eq!(
            captured,
            vec![
                "default",
                "glasses",
                "no_glasses",
                "left_angle",
                "right_angle",
                "smiling",
                "serious"
            ]
        );
        assert!(seq.session().is_none());

        let uploads = backend.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 7);
        assert!(uploads.iter().all(|(n, _)| n == "alice"));
    }

    #[tokio::test]
    async fn failed_upload_leaves_session_parked() {
        let frames = StubFrames::new();
        let backend = StubBackend::new();
        let (_tx, rx) = faces_channel(true);
        let mut seq = sequencer(frames, backend.clone(), rx);

        seq.start_session("bob").unwrap();
        backend.fail_next.store(true, Ordering::SeqCst);

        let err = seq.capture_current().await.unwrap_err();
        assert!(matches!(err, DoorError::Service(_)));
        assert_invariant(&seq);
        assert_eq!(seq.session().unwrap().catalog_index(), 0);
        assert_eq!(seq.current_variation(), Some("default"));

        // Same step succeeds on retry.
        match seq.capture_current().await.unwrap() {
            StepOutcome::Advanced { variation, index, .. } => {
                assert_eq!(variation, "default");
                assert_eq!(index, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_invariant(&seq);
    }

    #[tokio::test]
    async fn capture_requires_stream_and_face() {
        let frames = StubFrames::new();
        let backend = StubBackend::new();
        let (_tx, rx) = faces_channel(false);
        let mut seq = sequencer(frames.clone(), backend, rx);

        seq.start_session("carol").unwrap();
        assert!(matches!(
            seq.capture_current().await.unwrap_err(),
            DoorError::NoFaceDetected
        ));

        frames.streaming.store(false, Ordering::SeqCst);
        assert!(matches!(
            seq.capture_current().await.unwrap_err(),
            DoorError::NotStreaming
        ));
        assert_eq!(seq.session().unwrap().catalog_index(), 0);
    }

    #[tokio::test]
    async fn first_default_capture_offers_full_session() {
        let frames = StubFrames::new();
        let backend = StubBackend::new();
        let (_tx, rx) = faces_channel(true);
        let mut seq = sequencer(frames, backend, rx);

        seq.start_session("dave").unwrap();
        match seq.capture_current().await.unwrap() {
            StepOutcome::Advanced {
                offer_full_session, ..
            } => assert!(offer_full_session),
            other => panic!("unexpected outcome {other:?}"),
        }

        match seq.capture_current().await.unwrap() {
            StepOutcome::Advanced {
                offer_full_session, ..
            } => assert!(!offer_full_session),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_is_a_valid_terminal_state() {
        let frames = StubFrames::new();
        let backend = StubBackend::new();
        let (_tx, rx) = faces_channel(true);
        let mut seq = sequencer(frames, backend, rx);

        seq.start_session("erin").unwrap();
        seq.capture_current().await.unwrap();
        seq.capture_current().await.unwrap();

        let partial = seq.cancel().unwrap();
        assert_eq!(partial.catalog_index(), 2);
        assert_eq!(partial.captured_variations(), ["default", "glasses"]);
        assert!(seq.session().is_none());
        assert!(seq.cancel().is_none());

        assert!(matches!(
            seq.capture_current().await.unwrap_err(),
            DoorError::NoSession
        ));
    }

    #[test]
    fn person_names_are_validated() {
        assert!(validate_person_name("alice").is_ok());
        assert!(validate_person_name("Ngọc Anh").is_ok());
        assert!(validate_person_name("a").is_err());
        assert!(validate_person_name("rm -rf").is_err());
    }

    #[test]
    fn catalog_rejects_bad_names() {
        assert!(VariationCatalog::new(vec!["ok".into(), "also_ok".into()]).is_ok());
        assert!(VariationCatalog::new(vec!["with space".into()]).is_err());
        assert!(VariationCatalog::new(Vec::new()).is_err());
    }
}
