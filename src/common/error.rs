use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DoorError {
    #[error("camera permission denied: {0}")]
    CameraPermission(String),

    #[error("camera not found: {0}")]
    CameraNotFound(String),

    #[error("camera busy: {0}")]
    CameraBusy(String),

    #[error("camera format not usable: {0}")]
    CameraFormat(String),

    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("camera is not streaming")]
    NotStreaming,

    #[error("no frame available")]
    FrameUnavailable,

    #[error("no face detected")]
    NoFaceDetected,

    #[error("no enrollment session in progress")]
    NoSession,

    #[error("invalid person name: {0}")]
    InvalidName(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("service error: {0}")]
    Service(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl DoorError {
    /// Classify a device-open failure into the camera error taxonomy.
    pub fn from_device_open(index: u32, err: io::Error) -> Self {
        const EBUSY: i32 = 16;

        match err.kind() {
            io::ErrorKind::NotFound => {
                DoorError::CameraNotFound(format!("/dev/video{index}: {err}"))
            }
            io::ErrorKind::PermissionDenied => {
                DoorError::CameraPermission(format!("/dev/video{index}: {err}"))
            }
            _ if err.raw_os_error() == Some(EBUSY) => {
                DoorError::CameraBusy(format!("/dev/video{index}: {err}"))
            }
            _ => DoorError::CameraUnavailable(format!("/dev/video{index}: {err}")),
        }
    }

    pub fn is_camera_error(&self) -> bool {
        matches!(
            self,
            DoorError::CameraPermission(_)
                | DoorError::CameraNotFound(_)
                | DoorError::CameraBusy(_)
                | DoorError::CameraFormat(_)
                | DoorError::CameraUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DoorError>;
