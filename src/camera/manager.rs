use std::io::Cursor;
use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::DynamicImage;
use tokio::sync::watch;

use crate::camera::v4l2::{self, CameraDevice, Grabber};
use crate::common::config::CameraConfig;
use crate::common::error::{DoorError, Result};

/// A still frame captured from the active stream.
#[derive(Clone)]
pub struct CapturedFrame {
    image: DynamicImage,
}

impl CapturedFrame {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        self.image
            .write_to(&mut buf, image::ImageOutputFormat::Jpeg(85))?;
        Ok(buf.into_inner())
    }

    /// Base64 JPEG, the wire form the backend expects.
    pub fn to_base64_jpeg(&self) -> Result<String> {
        Ok(BASE64.encode(self.encode_jpeg()?))
    }
}

/// Read access to the single live capture resource.
///
/// Every frame consumer (detection, recognition capture, enrollment capture)
/// goes through this seam instead of holding a device handle of its own.
pub trait FrameSource: Send + Sync {
    fn is_streaming(&self) -> bool;

    /// `None` is a normal, retryable outcome: not streaming, a transient
    /// grab failure, or a zero-sized frame.
    fn capture_frame(&self) -> Option<CapturedFrame>;
}

/// Owns the one active camera capture resource.
pub struct CameraManager {
    config: CameraConfig,
    active: Mutex<Option<Grabber>>,
    streaming: watch::Sender<bool>,
}

impl CameraManager {
    pub fn new(config: CameraConfig) -> Self {
        let (streaming, _) = watch::channel(false);
        Self {
            config,
            active: Mutex::new(None),
            streaming,
        }
    }

    /// Enumerate selectable cameras; classified errors, no panics across
    /// the boundary.
    pub fn list_devices() -> Result<Vec<CameraDevice>> {
        v4l2::enumerate()
    }

    /// Observers see `true` strictly between a successful start and the
    /// next stop.
    pub fn streaming_watch(&self) -> watch::Receiver<bool> {
        self.streaming.subscribe()
    }

    /// Acquire the capture resource for `device_id`, or the first
    /// enumerable device when absent.
    ///
    /// Streaming flips to true only once the device reports usable non-zero
    /// dimensions; on any failure it stays false and the error is classified.
    pub fn start_stream(&self, device_id: Option<u32>) -> Result<CameraDevice> {
        let index = match device_id {
            Some(index) => index,
            None => v4l2::enumerate()?[0].device_id,
        };

        let grabber = Grabber::open(index, &self.config)?;
        let (width, height) = grabber.dimensions();
        if width == 0 || height == 0 {
            return Err(DoorError::CameraFormat(format!(
                "/dev/video{index} reported {width}x{height}"
            )));
        }

        let device = CameraDevice {
            device_id: index,
            label: grabber.label().to_string(),
        };

        *self.active.lock().unwrap() = Some(grabber);
        self.streaming.send_replace(true);
        tracing::info!("streaming from /dev/video{index} ({})", device.label);
        Ok(device)
    }

    /// Release the capture resource. Idempotent; always leaves
    /// streaming false.
    pub fn stop_stream(&self) {
        let released = self.active.lock().unwrap().take().is_some();
        self.streaming.send_replace(false);
        if released {
            tracing::info!("camera stream stopped");
        }
    }

    /// Stop, wait for the OS to release the device, then start the new one.
    /// Not atomic; concurrent switches must be serialized by the caller.
    pub async fn switch_camera(&self, device_id: u32) -> Result<CameraDevice> {
        self.stop_stream();
        tokio::time::sleep(self.config.switch_delay()).await;
        self.start_stream(Some(device_id))
    }
}

impl FrameSource for CameraManager {
    fn is_streaming(&self) -> bool {
        *self.streaming.borrow()
    }

    fn capture_frame(&self) -> Option<CapturedFrame> {
        let mut guard = self.active.lock().unwrap();
        let grabber = guard.as_mut()?;
        match grabber.grab() {
            Ok(image) if image.width() > 0 && image.height() > 0 => {
                Some(CapturedFrame::new(image))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("frame grab failed: {e}");
                None
            }
        }
    }
}
