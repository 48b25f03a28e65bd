use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::{broadcast, watch};

use crate::camera::{CameraDevice, CameraManager, FrameSource};
use crate::common::config::Config;
use crate::common::error::Result;
use crate::core::detector::{DetectedFace, FaceDetector};
use crate::core::enrollment::EnrollmentSequencer;
use crate::core::poller::DetectionPoller;
use crate::core::recognition::{ControllerHandles, RecognitionController};
use crate::events::{DoorEvent, EventBus, UnlockLatch};
use crate::service::RecognitionBackend;

/// Composition root: camera lifecycle, detection polling, recognition
/// attempts and enrollment, wired to one event bus and one unlock latch.
pub struct Orchestrator {
    config: Config,
    camera: Arc<CameraManager>,
    backend: Arc<dyn RecognitionBackend>,
    events: EventBus,
    latch: UnlockLatch,
    poller: Mutex<DetectionPoller>,
    faces: watch::Receiver<Vec<DetectedFace>>,
    controller: RecognitionController,
}

impl Orchestrator {
    /// Wire everything up and start the detection poller (it idles until
    /// the stream comes up). Must run inside a tokio runtime.
    pub fn new(
        config: Config,
        camera: Arc<CameraManager>,
        detector: Arc<dyn FaceDetector>,
        backend: Arc<dyn RecognitionBackend>,
    ) -> Self {
        let events = EventBus::new();
        let latch = UnlockLatch::new(config.recognition.unlock_ttl());

        let frames: Arc<dyn FrameSource> = camera.clone();
        let (poller, faces) = DetectionPoller::spawn(
            frames.clone(),
            detector,
            camera.streaming_watch(),
            config.detection.interval(),
        );

        let controller = RecognitionController::new(
            &config.recognition,
            ControllerHandles {
                frames,
                backend: backend.clone(),
                faces: faces.clone(),
                streaming: camera.streaming_watch(),
                events: events.clone(),
                latch: latch.clone(),
            },
        );

        Self {
            config,
            camera,
            backend,
            events,
            latch,
            poller: Mutex::new(poller),
            faces,
            controller,
        }
    }

    pub fn start_stream(&self, device_id: Option<u32>) -> Result<CameraDevice> {
        let device = self.camera.start_stream(device_id)?;
        self.events.publish(DoorEvent::StreamStarted {
            device_id: device.device_id,
            label: device.label.clone(),
        });
        Ok(device)
    }

    /// Release the camera and force the attempt controller to Idle with
    /// auto recognition off, in the same call.
    pub fn stop_stream(&self) {
        self.camera.stop_stream();
        self.controller.deactivate();
        self.events.publish(DoorEvent::StreamStopped);
    }

    /// Stop, wait for the OS to release the device, start the new one.
    /// Auto recognition is deactivated by the stop and must be restarted
    /// explicitly afterwards.
    pub async fn switch_camera(&self, device_id: u32) -> Result<CameraDevice> {
        self.controller.deactivate();
        self.events.publish(DoorEvent::StreamStopped);
        let device = self.camera.switch_camera(device_id).await?;
        self.events.publish(DoorEvent::StreamStarted {
            device_id: device.device_id,
            label: device.label.clone(),
        });
        Ok(device)
    }

    pub fn start_auto_recognition(&self) {
        self.controller.start_auto_recognition();
    }

    pub fn stop_auto_recognition(&self) {
        self.controller.stop_auto_recognition();
    }

    pub fn controller(&self) -> &RecognitionController {
        &self.controller
    }

    pub fn sequencer(&self) -> Result<EnrollmentSequencer> {
        EnrollmentSequencer::new(
            &self.config.enrollment,
            self.camera.clone(),
            self.faces.clone(),
            self.backend.clone(),
            self.events.clone(),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DoorEvent> {
        self.events.subscribe()
    }

    pub fn unlock_latch(&self) -> &UnlockLatch {
        &self.latch
    }

    pub fn faces(&self) -> watch::Receiver<Vec<DetectedFace>> {
        self.faces.clone()
    }

    pub fn camera(&self) -> &CameraManager {
        &self.camera
    }

    pub fn backend(&self) -> Arc<dyn RecognitionBackend> {
        self.backend.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Tear down both loops and release the camera.
    pub fn shutdown(&self) {
        self.stop_stream();
        self.controller.stop_auto_recognition();
        self.poller.lock().unwrap().stop();
    }
}
