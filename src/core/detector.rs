use crate::common::config::DetectorConfig;
use crate::common::{FaceGateError, Result};
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &FaceBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// YOLO-style single-class face detector.
pub struct FaceDetector {
    session: Session,
    _environment: Arc<Environment>,
    config: DetectorConfig,
}

impl FaceDetector {
    pub fn new(model_path: &Path, config: &DetectorConfig) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_detector")
                .build()
                .map_err(|e| FaceGateError::Model(format!("Failed to create environment: {}", e)))?
        );

        if !model_path.exists() {
            return Err(FaceGateError::Model(
                format!("Detector model not found at: {:?}", model_path)
            ));
        }

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_model_from_file(model_path)?;

        Ok(Self {
            session,
            _environment: environment,
            config: config.clone(),
        })
    }

    /// Every candidate face above the configured floor, most confident first,
    /// in original image coordinates.
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;

        let img_array = if image.width() == self.config.input_width
            && image.height() == self.config.input_height {
            self.image_to_array(image)
        } else {
            let resized = image.resize_exact(
                self.config.input_width,
                self.config.input_height,
                FilterType::Nearest
            );
            self.image_to_array(&resized)
        };

        let cow_array = CowArray::from(img_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let mut faces = self.parse_detections(&outputs)?;

        let scale_x = orig_width / self.config.input_width as f32;
        let scale_y = orig_height / self.config.input_height as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        Ok(faces)
    }

    fn image_to_array(&self, img: &DynamicImage) -> Array4<f32> {
        // Grayscale replicated across the three input channels
        let gray = img.to_luma8();
        let width = gray.width() as usize;
        let height = gray.height() as usize;
        let raw = gray.as_raw();
        let mut array = Array4::<f32>::zeros((1, 3, height, width));

        let norm_factor = 1.0 / 255.0;
        for y in 0..height {
            let row_offset = y * width;
            for x in 0..width {
                let value = raw[row_offset + x] as f32 * norm_factor;
                array[[0, 0, y, x]] = value;
                array[[0, 1, y, x]] = value;
                array[[0, 2, y, x]] = value;
            }
        }

        array
    }

    fn parse_detections(&self, outputs: &[Value]) -> Result<Vec<FaceBox>> {
        let Some(first) = outputs.first() else {
            return Ok(Vec::new());
        };

        let output = first.try_extract::<f32>()?.view().to_owned();
        let shape = output.shape().to_vec();
        let data = output
            .as_slice()
            .ok_or_else(|| FaceGateError::Model("Detector output is not contiguous".into()))?;

        // [1, N, 5+] or transposed [1, 5+, N]
        let (num_predictions, prediction_length, is_transposed) = match shape.len() {
            3 if shape[2] > shape[1] && shape[1] <= 10 => (shape[2], shape[1], true),
            3 => (shape[1], shape[2], false),
            2 => (shape[0], shape[1], false),
            _ => {
                tracing::warn!("Unexpected detector output shape: {:?}", shape);
                return Ok(Vec::new());
            }
        };
        if prediction_length < 5 {
            return Ok(Vec::new());
        }

        let input_width = self.config.input_width as f32;
        let input_height = self.config.input_height as f32;
        let mut faces = Vec::new();

        for i in 0..num_predictions {
            let at = |field: usize| {
                if is_transposed {
                    data[field * num_predictions + i]
                } else {
                    data[i * prediction_length + field]
                }
            };
            let (cx, cy, w, h, confidence) = (at(0), at(1), at(2), at(3), at(4));

            if confidence < self.config.candidate_confidence {
                continue;
            }

            let (x1, y1, x2, y2) = decode_center_box(cx, cy, w, h, input_width, input_height);

            if x2 - x1 > 10.0 && y2 - y1 > 10.0 {
                faces.push(FaceBox { x1, y1, x2, y2, confidence });
            }
        }

        Ok(apply_nms(faces, self.config.nms_iou))
    }
}

/// Center-format prediction to corners clamped to the input frame.
/// Normalized predictions (every field <= 1) are scaled per axis.
fn decode_center_box(
    cx: f32,
    cy: f32,
    w: f32,
    h: f32,
    input_width: f32,
    input_height: f32,
) -> (f32, f32, f32, f32) {
    let normalized = cx <= 1.0 && cy <= 1.0 && w <= 1.0 && h <= 1.0;
    let (sx, sy) = if normalized { (input_width, input_height) } else { (1.0, 1.0) };
    let (cx, cy, w, h) = (cx * sx, cy * sy, w * sx, h * sy);

    (
        (cx - w / 2.0).max(0.0),
        (cy - h / 2.0).max(0.0),
        (cx + w / 2.0).min(input_width),
        (cy + h / 2.0).min(input_height),
    )
}

/// Greedy non-maximum suppression; output sorted by descending confidence.
pub fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| kept.iou(&candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}
