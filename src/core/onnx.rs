use crate::common::{Config, Result};
use crate::core::analysis::{FaceAnalyzer, Recognition, Validation};
use crate::core::detector::{FaceBox, FaceDetector};
use crate::core::recognizer::{cosine_similarity, Embedding, FaceRecognizer};
use crate::storage::{IdentityEntry, IdentityStore};
use image::DynamicImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

struct CachedReference {
    modified: Option<SystemTime>,
    embedding: Option<Embedding>,
}

/// Local analyzer running ONNX detection and embedding models against the
/// identity store.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    identities: IdentityStore,
    // Reference embeddings keyed by path, invalidated by mtime
    references: Mutex<HashMap<PathBuf, CachedReference>>,
}

impl OnnxFaceAnalyzer {
    pub fn new(config: &Config) -> Result<Self> {
        let detector = FaceDetector::new(&config.models.detector_path, &config.detector)?;
        let recognizer = FaceRecognizer::new(&config.models.recognizer_path, &config.recognizer)?;
        let identities = IdentityStore::new(&config.storage.identity_dir)?;

        Ok(Self {
            detector,
            recognizer,
            identities,
            references: Mutex::new(HashMap::new()),
        })
    }

    fn detect(&self, image: &Path) -> Result<(DynamicImage, Vec<FaceBox>)> {
        let decoded = image::open(image)?;
        let faces = self.detector.detect(&decoded)?;
        Ok((decoded, faces))
    }

    fn try_recognize(&self, image: &Path) -> Result<Recognition> {
        tracing::info!("[ANALYSIS] Starting face search for: {}", display_name(image));

        let (decoded, faces) = self.detect(image)?;
        let validation = Validation::from_confidences(&confidences(&faces));
        if !validation.has_face {
            return Ok(Recognition::Error { message: validation.message });
        }
        if validation.is_ambiguous() {
            tracing::warn!("[WARNING] {}", validation.message);
        }

        // Faces are sorted by confidence, so the first one is the best
        let query = self.recognizer.get_embedding(&decoded, &faces[0])?;

        let mut best: Option<(String, f32)> = None;
        for entry in self.identities.entries()? {
            let Some(reference) = self.reference_embedding(&entry) else { continue };
            let similarity = cosine_similarity(&query, &reference);
            tracing::debug!("Similarity to {}: {:.3}", entry.name, similarity);
            if best.as_ref().map_or(true, |(_, s)| similarity > *s) {
                best = Some((entry.name.clone(), similarity));
            }
        }

        match best {
            Some((person, similarity)) if similarity > self.recognizer.similarity_threshold() => {
                tracing::info!(">> SUCCESS: Match Found! Identified as: {} ({:.3})", person, similarity);
                Ok(Recognition::Granted { person })
            }
            _ => {
                tracing::info!(">> FAILURE: No match found in the database.");
                Ok(Recognition::Denied)
            }
        }
    }

    fn reference_embedding(&self, entry: &IdentityEntry) -> Option<Embedding> {
        {
            let cache = self.references.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(&entry.path) {
                if cached.modified == entry.modified {
                    return cached.embedding.clone();
                }
            }
        }

        let embedding = match self.embed_reference(&entry.path) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Skipping reference image {}: {}", entry.path.display(), e);
                None
            }
        };

        let mut cache = self.references.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(entry.path.clone(), CachedReference {
            modified: entry.modified,
            embedding: embedding.clone(),
        });
        embedding
    }

    fn embed_reference(&self, path: &Path) -> Result<Option<Embedding>> {
        let (decoded, faces) = self.detect(path)?;
        match faces.first() {
            Some(face) => Ok(Some(self.recognizer.get_embedding(&decoded, face)?)),
            None => {
                tracing::warn!("No face found in reference image {}", path.display());
                Ok(None)
            }
        }
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn validate(&self, image: &Path) -> Validation {
        match self.detect(image) {
            Ok((_, faces)) => Validation::from_confidences(&confidences(&faces)),
            Err(e) => Validation::rejected(format!("Face validation error: {}", e)),
        }
    }

    fn recognize(&self, image: &Path) -> Recognition {
        match self.try_recognize(image) {
            Ok(recognition) => recognition,
            Err(e) => {
                tracing::error!("[ERROR] An unexpected error occurred during analysis: {}", e);
                Recognition::Error { message: e.to_string() }
            }
        }
    }
}

fn confidences(faces: &[FaceBox]) -> Vec<f32> {
    faces.iter().map(|f| f.confidence).collect()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
