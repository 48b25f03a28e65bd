use std::fs;
use std::time::Duration;

use image::{DynamicImage, ImageBuffer, Luma};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::common::config::CameraConfig;
use crate::common::error::{DoorError, Result};

/// A selectable physical camera, as reported by device enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDevice {
    pub device_id: u32,
    pub label: String,
}

/// Enumerate V4L2 capture devices under /dev.
///
/// Devices that cannot be opened or queried are skipped; an empty result is
/// reported as a classified error so callers land in an error state rather
/// than a silent no-camera loop.
pub fn enumerate() -> Result<Vec<CameraDevice>> {
    let entries = fs::read_dir("/dev")
        .map_err(|e| DoorError::CameraUnavailable(format!("cannot scan /dev: {e}")))?;

    let mut devices = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(index) = name
            .to_str()
            .and_then(|n| n.strip_prefix("video"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };

        let Ok(device) = Device::new(index as usize) else {
            continue;
        };
        let Ok(caps) = device.query_caps() else {
            continue;
        };
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            continue;
        }

        devices.push(CameraDevice {
            device_id: index,
            label: caps.card.clone(),
        });
    }

    devices.sort_by_key(|d| d.device_id);
    if devices.is_empty() {
        return Err(DoorError::CameraNotFound(
            "no video capture devices present".into(),
        ));
    }
    Ok(devices)
}

/// Exclusive handle on one open capture device.
pub(crate) struct Grabber {
    device: Device,
    fourcc: [u8; 4],
    width: u32,
    height: u32,
    label: String,
    warmup_frames: u32,
    warmup_delay: Duration,
}

impl Grabber {
    pub(crate) fn open(index: u32, config: &CameraConfig) -> Result<Self> {
        let device =
            Device::new(index as usize).map_err(|e| DoorError::from_device_open(index, e))?;

        let caps = device.query_caps().map_err(|e| {
            DoorError::CameraUnavailable(format!("/dev/video{index}: cannot query caps: {e}"))
        })?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(DoorError::CameraFormat(format!(
                "/dev/video{index} ({}) does not support video capture",
                caps.card
            )));
        }

        let mut fmt = device.format().map_err(|e| {
            DoorError::CameraFormat(format!("/dev/video{index}: cannot read format: {e}"))
        })?;

        fmt.width = config.width;
        fmt.height = config.height;
        // IR sensors deliver GREY; everything else is negotiated to MJPG.
        if fmt.fourcc.repr != *b"GREY" {
            fmt.fourcc = FourCC::new(b"MJPG");
        }

        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("/dev/video{index}: could not set requested format: {e}");
        }

        let final_fmt = device.format().map_err(|e| {
            DoorError::CameraFormat(format!("/dev/video{index}: cannot read format: {e}"))
        })?;

        if final_fmt.fourcc.repr != *b"GREY" && final_fmt.fourcc.repr != *b"MJPG" {
            return Err(DoorError::CameraFormat(format!(
                "/dev/video{index}: unsupported pixel format {:?}",
                final_fmt.fourcc
            )));
        }
        if final_fmt.width != config.width || final_fmt.height != config.height {
            tracing::warn!(
                "/dev/video{index}: resolution {}x{} differs from requested {}x{}",
                final_fmt.width,
                final_fmt.height,
                config.width,
                config.height
            );
        }

        Ok(Self {
            device,
            fourcc: final_fmt.fourcc.repr,
            width: final_fmt.width,
            height: final_fmt.height,
            label: caps.card,
            warmup_frames: config.warmup_frames,
            warmup_delay: config.warmup_delay(),
        })
    }

    pub(crate) fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    /// Grab one frame, decoded to an image.
    ///
    /// Each grab opens a short-lived mmap stream; warmup frames are drained
    /// first so IR emitters have settled before the kept frame.
    pub(crate) fn grab(&mut self) -> Result<DynamicImage> {
        let mut stream = v4l::io::mmap::Stream::with_buffers(&mut self.device, Type::VideoCapture, 4)
            .map_err(|e| DoorError::CameraUnavailable(format!("cannot create stream: {e}")))?;

        for _ in 0..self.warmup_frames {
            stream
                .next()
                .map_err(|e| DoorError::CameraUnavailable(format!("warmup capture failed: {e}")))?;
            std::thread::sleep(self.warmup_delay);
        }

        let (buf, _meta) = stream
            .next()
            .map_err(|e| DoorError::CameraUnavailable(format!("capture failed: {e}")))?;

        match &self.fourcc {
            b"GREY" => grey_to_image(buf, self.width, self.height),
            b"MJPG" => Ok(image::load_from_memory(buf)?),
            other => Err(DoorError::CameraFormat(format!(
                "unsupported pixel format {other:?}"
            ))),
        }
    }
}

fn grey_to_image(data: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    let buffer = ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data.to_vec())
        .ok_or_else(|| DoorError::CameraFormat("grayscale buffer size mismatch".into()))?;
    Ok(DynamicImage::ImageLuma8(buffer))
}
