pub mod analysis;
pub mod detector;
pub mod onnx;
pub mod recognizer;

pub use analysis::{FaceAnalysisGateway, FaceAnalyzer, Recognition, Validation, QUALIFYING_FACE_CONFIDENCE};
pub use detector::{FaceBox, FaceDetector};
pub use onnx::OnnxFaceAnalyzer;
pub use recognizer::{cosine_similarity, Embedding, FaceRecognizer};
