use std::sync::Arc;

use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};

use crate::common::config::Config;
use crate::common::error::{DoorError, Result};

/// Fixed-length numeric embedding of a detected face.
pub type Descriptor = Vec<f32>;

#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// One face found in a single detection pass. Produced per tick and
/// discarded with the next pass; nothing here is persisted.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub descriptor: Descriptor,
}

/// Opaque detection service.
///
/// `is_ready` is the one-time models-ready signal the poller waits for
/// before its first pass.
pub trait FaceDetector: Send + Sync {
    fn is_ready(&self) -> bool;

    fn detect(&self, frame: &DynamicImage) -> Result<Vec<DetectedFace>>;
}

/// ONNX-backed detector: a YOLO-format detection head plus a per-face
/// embedding model.
pub struct OnnxFaceDetector {
    detector: Session,
    embedder: Session,
    _environment: Arc<Environment>,
    input_width: u32,
    input_height: u32,
    embed_size: u32,
    normalization: f32,
    confidence: f32,
}

const NMS_IOU_THRESHOLD: f32 = 0.45;
const MAX_FACES: usize = 5;

impl OnnxFaceDetector {
    pub fn load(config: &Config) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_models")
                .build()
                .map_err(|e| DoorError::Model(format!("failed to create environment: {e}")))?,
        );

        let detector = Self::load_session(&environment, &config.models.detector_path)?;
        let embedder = Self::load_session(&environment, &config.models.embedder_path)?;

        Ok(Self {
            detector,
            embedder,
            _environment: environment,
            input_width: config.detector.input_width,
            input_height: config.detector.input_height,
            embed_size: config.embedder.input_size,
            normalization: config.embedder.normalization_value,
            confidence: config.detection.confidence,
        })
    }

    fn load_session(environment: &Arc<Environment>, path: &std::path::Path) -> Result<Session> {
        if !path.exists() {
            return Err(DoorError::Model(format!(
                "model not found at {}",
                path.display()
            )));
        }
        let session = SessionBuilder::new(environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_model_from_file(path)?;
        Ok(session)
    }

    fn detect_boxes(&self, frame: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>> {
        let orig_width = frame.width() as f32;
        let orig_height = frame.height() as f32;

        let resized = if frame.width() == self.input_width && frame.height() == self.input_height {
            frame.clone()
        } else {
            frame.resize_exact(self.input_width, self.input_height, FilterType::Nearest)
        };

        let input = self.frame_to_array(&resized);
        let cow = CowArray::from(input.into_dyn());
        let tensor = Value::from_array(self.detector.allocator(), &cow)?;
        let outputs = self.detector.run(vec![tensor])?;

        let raw = outputs[0].try_extract::<f32>()?.view().to_owned();
        let shape = raw.shape().to_vec();
        let data = raw
            .as_slice()
            .ok_or_else(|| DoorError::Model("non-contiguous detector output".into()))?;

        // Output is either [1, N, 5] or the transposed [1, 5, N].
        let (count, stride, transposed) = match shape.as_slice() {
            [_, a, b] if b > a && *a <= 10 => (*b, *a, true),
            [_, a, b] => (*a, *b, false),
            [a, b] => (*a, *b, false),
            other => {
                tracing::warn!("unexpected detector output shape {other:?}");
                return Ok(Vec::new());
            }
        };

        let mut boxes = Vec::new();
        for i in 0..count {
            let (cx, cy, w, h, confidence) = if transposed {
                (
                    data[i],
                    data[count + i],
                    data[2 * count + i],
                    data[3 * count + i],
                    if stride > 4 { data[4 * count + i] } else { 0.0 },
                )
            } else {
                let base = i * stride;
                (
                    data[base],
                    data[base + 1],
                    data[base + 2],
                    data[base + 3],
                    if stride > 4 { data[base + 4] } else { 0.0 },
                )
            };
            if confidence <= 0.001 {
                continue;
            }

            // Normalized outputs are scaled up to input-pixel space.
            let scale = if cx > 1.0 || cy > 1.0 || w > 1.0 || h > 1.0 {
                1.0
            } else {
                self.input_width as f32
            };
            let (cx, cy, w, h) = (cx * scale, cy * scale, w * scale, h * scale);

            let bbox = BoundingBox {
                x1: (cx - w / 2.0).max(0.0),
                y1: (cy - h / 2.0).max(0.0),
                x2: (cx + w / 2.0).min(self.input_width as f32),
                y2: (cy + h / 2.0).min(self.input_height as f32),
            };
            if bbox.width() > 10.0 && bbox.height() > 10.0 {
                boxes.push((bbox, confidence));
            }
        }

        let mut kept = nms(boxes, NMS_IOU_THRESHOLD);
        kept.retain(|(_, c)| *c >= self.confidence);
        kept.truncate(MAX_FACES);

        let scale_x = orig_width / self.input_width as f32;
        let scale_y = orig_height / self.input_height as f32;
        for (bbox, _) in &mut kept {
            bbox.x1 *= scale_x;
            bbox.x2 *= scale_x;
            bbox.y1 *= scale_y;
            bbox.y2 *= scale_y;
        }

        Ok(kept)
    }

    fn frame_to_array(&self, frame: &DynamicImage) -> Array4<f32> {
        let gray = frame.to_luma8();
        let width = gray.width() as usize;
        let height = gray.height() as usize;
        let data = gray.as_raw();

        // Single channel replicated across the three input channels.
        let mut array = Array4::<f32>::zeros((1, 3, height, width));
        for y in 0..height {
            let row = y * width;
            for x in 0..width {
                let value = data[row + x] as f32 / 255.0;
                array[[0, 0, y, x]] = value;
                array[[0, 1, y, x]] = value;
                array[[0, 2, y, x]] = value;
            }
        }
        array
    }

    fn embed(&self, frame: &DynamicImage, bbox: &BoundingBox) -> Result<Descriptor> {
        let x = bbox.x1.max(0.0) as u32;
        let y = bbox.y1.max(0.0) as u32;
        let width = bbox.width().max(1.0) as u32;
        let height = bbox.height().max(1.0) as u32;

        let face = frame
            .crop_imm(x, y, width, height)
            .resize_exact(self.embed_size, self.embed_size, FilterType::Triangle);

        let gray = face.to_luma8();
        let size = self.embed_size as usize;
        let mut array = Array4::<f32>::zeros((1, 1, size, size));
        for y in 0..size {
            for x in 0..size {
                let pixel = gray.get_pixel(x as u32, y as u32);
                array[[0, 0, y, x]] = (pixel[0] as f32 - self.normalization) / self.normalization;
            }
        }

        let cow = CowArray::from(array.into_dyn());
        let tensor = Value::from_array(self.embedder.allocator(), &cow)?;
        let outputs = self.embedder.run(vec![tensor])?;
        let descriptor = outputs[0].try_extract::<f32>()?.view().to_owned().into_raw_vec();
        Ok(descriptor)
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn is_ready(&self) -> bool {
        // Sessions are loaded in `load`; a constructed detector is ready.
        true
    }

    fn detect(&self, frame: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let boxes = self.detect_boxes(frame)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for (bbox, confidence) in boxes {
            let descriptor = self.embed(frame, &bbox)?;
            faces.push(DetectedFace {
                bbox,
                confidence,
                descriptor,
            });
        }
        Ok(faces)
    }
}

fn nms(mut boxes: Vec<(BoundingBox, f32)>, iou_threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut kept: Vec<(BoundingBox, f32)> = Vec::new();
    for (bbox, confidence) in boxes {
        if kept.iter().all(|(k, _)| iou(k, &bbox) < iou_threshold) {
            kept.push((bbox, confidence));
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width() * a.height() + b.width() * b.height() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
