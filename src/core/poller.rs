use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::camera::FrameSource;
use crate::core::detector::{DetectedFace, FaceDetector};

/// Periodic face detection over the live frame.
///
/// Runs one pass per tick while the stream is up and the detector is ready,
/// publishing results on a watch channel. A pass is awaited inline and
/// missed ticks are skipped, never queued, so two passes can never be in
/// flight at once.
pub struct DetectionPoller {
    handle: Option<JoinHandle<()>>,
}

impl DetectionPoller {
    pub fn spawn(
        frames: Arc<dyn FrameSource>,
        detector: Arc<dyn FaceDetector>,
        streaming: watch::Receiver<bool>,
        interval: Duration,
    ) -> (Self, watch::Receiver<Vec<DetectedFace>>) {
        let (faces_tx, faces_rx) = watch::channel(Vec::new());

        let handle = tokio::spawn(run_loop(frames, detector, streaming, faces_tx, interval));

        (Self { handle: Some(handle) }, faces_rx)
    }

    /// Tear down the polling task and release its timer.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for DetectionPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    frames: Arc<dyn FrameSource>,
    detector: Arc<dyn FaceDetector>,
    mut streaming: watch::Receiver<bool>,
    faces_tx: watch::Sender<Vec<DetectedFace>>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if !*streaming.borrow() {
            // Stream down: publish empty and park until it comes back.
            faces_tx.send_replace(Vec::new());
            if streaming.changed().await.is_err() {
                return;
            }
            continue;
        }

        ticker.tick().await;

        if !*streaming.borrow() || !detector.is_ready() {
            continue;
        }

        let Some(frame) = frames.capture_frame() else {
            continue;
        };

        match detector.detect(frame.image()) {
            Ok(faces) => {
                faces_tx.send_replace(faces);
            }
            Err(e) => {
                // A failed pass degrades to "no faces"; the loop never halts.
                tracing::warn!("detection pass failed: {e}");
                faces_tx.send_replace(Vec::new());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use image::DynamicImage;

    use crate::camera::CapturedFrame;
    use crate::common::error::Result;
    use crate::core::detector::BoundingBox;

    struct StaticFrames;

    impl FrameSource for StaticFrames {
        fn is_streaming(&self) -> bool {
            true
        }

        fn capture_frame(&self) -> Option<CapturedFrame> {
            Some(CapturedFrame::new(DynamicImage::new_luma8(32, 32)))
        }
    }

    struct CountingDetector {
        calls: AtomicU32,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
        delay: Duration,
        faces: Mutex<Vec<DetectedFace>>,
    }

    impl CountingDetector {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicU32::new(0),
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
                delay,
                faces: Mutex::new(vec![one_face()]),
            }
        }
    }

    fn one_face() -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: 20.0,
                y2: 20.0,
            },
            confidence: 0.9,
            descriptor: vec![0.0; 128],
        }
    }

    impl FaceDetector for CountingDetector {
        fn is_ready(&self) -> bool {
            true
        }

        fn detect(&self, _frame: &DynamicImage) -> Result<Vec<DetectedFace>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(self.faces.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn publishes_detected_faces_while_streaming() {
        let detector = Arc::new(CountingDetector::new(Duration::ZERO));
        let (_streaming_tx, streaming_rx) = watch::channel(true);
        let (mut poller, mut faces) = DetectionPoller::spawn(
            Arc::new(StaticFrames),
            detector.clone(),
            streaming_rx,
            Duration::from_millis(10),
        );

        faces.changed().await.unwrap();
        assert_eq!(faces.borrow().len(), 1);
        assert!(detector.calls.load(Ordering::SeqCst) >= 1);
        poller.stop();
    }

    #[tokio::test]
    async fn passes_never_overlap_even_when_slow() {
        // Detection takes several poll intervals; overlapping ticks must be
        // skipped rather than queued.
        let detector = Arc::new(CountingDetector::new(Duration::from_millis(30)));
        let (_streaming_tx, streaming_rx) = watch::channel(true);
        let (mut poller, _faces) = DetectionPoller::spawn(
            Arc::new(StaticFrames),
            detector.clone(),
            streaming_rx,
            Duration::from_millis(5),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        poller.stop();

        assert_eq!(detector.max_in_flight.load(Ordering::SeqCst), 1);
        // Far fewer passes than elapsed/interval, because ticks were skipped.
        assert!(detector.calls.load(Ordering::SeqCst) <= 8);
    }

    #[tokio::test]
    async fn stops_detecting_when_stream_goes_down() {
        let detector = Arc::new(CountingDetector::new(Duration::ZERO));
        let (streaming_tx, streaming_rx) = watch::channel(true);
        let (mut poller, mut faces) = DetectionPoller::spawn(
            Arc::new(StaticFrames),
            detector.clone(),
            streaming_rx,
            Duration::from_millis(10),
        );

        faces.changed().await.unwrap();
        streaming_tx.send_replace(false);

        // The poller publishes an empty list once it observes the change.
        loop {
            faces.changed().await.unwrap();
            if faces.borrow().is_empty() {
                break;
            }
        }

        let settled = detector.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(detector.calls.load(Ordering::SeqCst), settled);
        poller.stop();
    }
}
