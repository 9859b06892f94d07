use crate::common::config::RecognizerConfig;
use crate::common::{FaceGateError, Result};
use crate::core::detector::FaceBox;
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::path::Path;
use std::sync::Arc;

pub type Embedding = Vec<f32>;

pub struct FaceRecognizer {
    session: Session,
    _environment: Arc<Environment>,
    config: RecognizerConfig,
}

impl FaceRecognizer {
    pub fn new(model_path: &Path, config: &RecognizerConfig) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_recognizer")
                .build()
                .map_err(|e| FaceGateError::Model(format!("Failed to create environment: {}", e)))?
        );

        if !model_path.exists() {
            return Err(FaceGateError::Model(
                format!("Recognition model not found at: {:?}", model_path)
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

    pub fn similarity_threshold(&self) -> f32 {
        self.config.similarity_threshold
    }

    pub fn get_embedding(&self, image: &DynamicImage, face: &FaceBox) -> Result<Embedding> {
        let face_img = crop_face(image, face);

        let resized = face_img.resize_exact(
            self.config.input_size,
            self.config.input_size,
            FilterType::Triangle
        );

        let input_array = self.preprocess_face(&resized);
        let cow_array = CowArray::from(input_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;

        let outputs = self.session.run(vec![input_tensor])?;
        let first = outputs
            .first()
            .ok_or_else(|| FaceGateError::Model("Recognizer produced no output".into()))?;

        let embedding = first.try_extract::<f32>()?.view().iter().copied().collect();
        Ok(embedding)
    }

    fn preprocess_face(&self, img: &DynamicImage) -> Array4<f32> {
        let gray = img.to_luma8();
        let size = self.config.input_size as usize;
        let norm_val = self.config.normalization_value;
        let mut array = Array4::<f32>::zeros((1, 1, size, size));

        for y in 0..size {
            for x in 0..size {
                let pixel = gray.get_pixel(x as u32, y as u32);
                array[[0, 0, y, x]] = (pixel[0] as f32 - norm_val) / norm_val;
            }
        }

        array
    }
}

fn crop_face(image: &DynamicImage, face: &FaceBox) -> DynamicImage {
    let x = face.x1.max(0.0) as u32;
    let y = face.y1.max(0.0) as u32;
    let width = (face.x2 - face.x1).max(1.0) as u32;
    let height = (face.y2 - face.y1).max(1.0) as u32;

    image.crop_imm(x, y, width, height)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_parallel_vectors_is_one() {
        let a = [1.0, 2.0, 3.0];
        let b = [2.0, 4.0, 6.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_with_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn crop_clamps_negative_origin() {
        let image = DynamicImage::new_luma8(50, 50);
        let face = FaceBox { x1: -5.0, y1: -5.0, x2: 20.0, y2: 30.0, confidence: 0.9 };
        let cropped = crop_face(&image, &face);
        assert_eq!(cropped.width(), 25);
        assert_eq!(cropped.height(), 35);
    }
}
