//! Face analysis boundary.
//!
//! [`FaceAnalyzer`] is the synchronous interface to whatever performs face
//! detection and identification. [`FaceAnalysisGateway`] is what connection
//! handlers talk to: it runs analyzer calls on the blocking pool, bounded by a
//! fixed number of worker permits, and turns every failure into a result value.

use crate::common::{FaceGateError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Minimum detector confidence (exclusive) for a face to count.
pub const QUALIFYING_FACE_CONFIDENCE: f32 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub has_face: bool,
    pub face_count: usize,
    pub message: String,
}

impl Validation {
    /// Classify raw detector scores for one image.
    pub fn from_confidences(confidences: &[f32]) -> Self {
        if confidences.is_empty() {
            return Self::rejected("No faces detected in the image");
        }

        let face_count = confidences
            .iter()
            .filter(|c| **c > QUALIFYING_FACE_CONFIDENCE)
            .count();

        match face_count {
            0 => Self::rejected("No clear human faces detected"),
            1 => Self {
                has_face: true,
                face_count,
                message: "Single face detected".to_string(),
            },
            n => Self {
                has_face: true,
                face_count: n,
                message: format!("Multiple faces detected ({})", n),
            },
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            has_face: false,
            face_count: 0,
            message: message.into(),
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        self.face_count > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recognition {
    Granted { person: String },
    Denied,
    Error { message: String },
}

/// Detection and identification over an image on disk.
///
/// Implementations must not panic or fail on bad input; they report problems
/// through the returned values instead.
pub trait FaceAnalyzer: Send + Sync {
    fn validate(&self, image: &Path) -> Validation;
    fn recognize(&self, image: &Path) -> Recognition;
}

#[derive(Clone)]
pub struct FaceAnalysisGateway {
    analyzer: Arc<dyn FaceAnalyzer>,
    workers: Arc<Semaphore>,
}

impl FaceAnalysisGateway {
    pub fn new(analyzer: Arc<dyn FaceAnalyzer>, workers: usize) -> Self {
        Self {
            analyzer,
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub async fn validate(&self, image: &Path) -> Validation {
        let analyzer = Arc::clone(&self.analyzer);
        let path = image.to_path_buf();

        match self.dispatch(move || analyzer.validate(&path)).await {
            Ok(validation) => validation,
            Err(e) => {
                tracing::error!("Validation worker failed: {}", e);
                Validation::rejected(format!("Face validation error: {}", e))
            }
        }
    }

    pub async fn recognize(&self, image: &Path) -> Recognition {
        let analyzer = Arc::clone(&self.analyzer);
        let path: PathBuf = image.to_path_buf();

        match self.dispatch(move || analyzer.recognize(&path)).await {
            Ok(recognition) => recognition,
            Err(e) => {
                tracing::error!("Recognition worker failed: {}", e);
                Recognition::Error { message: e.to_string() }
            }
        }
    }

    async fn dispatch<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|e| FaceGateError::Analysis(format!("Worker pool closed: {}", e)))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| FaceGateError::Analysis(format!("Analysis task aborted: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn no_detections_is_rejected() {
        let v = Validation::from_confidences(&[]);
        assert!(!v.has_face);
        assert_eq!(v.message, "No faces detected in the image");
    }

    #[test]
    fn low_confidence_detections_are_not_clear_faces() {
        let v = Validation::from_confidences(&[0.5, 0.8]);
        assert!(!v.has_face);
        assert_eq!(v.face_count, 0);
        assert_eq!(v.message, "No clear human faces detected");
    }

    #[test]
    fn counts_only_qualifying_faces() {
        let v = Validation::from_confidences(&[0.95, 0.3]);
        assert!(v.has_face);
        assert_eq!(v.face_count, 1);
        assert!(!v.is_ambiguous());

        let v = Validation::from_confidences(&[0.95, 0.9, 0.81]);
        assert_eq!(v.face_count, 3);
        assert_eq!(v.message, "Multiple faces detected (3)");
        assert!(v.is_ambiguous());
    }

    struct PanickingAnalyzer;

    impl FaceAnalyzer for PanickingAnalyzer {
        fn validate(&self, _image: &Path) -> Validation {
            panic!("model exploded")
        }
        fn recognize(&self, _image: &Path) -> Recognition {
            panic!("model exploded")
        }
    }

    #[tokio::test]
    async fn panicking_analyzer_becomes_error_result() {
        let gateway = FaceAnalysisGateway::new(Arc::new(PanickingAnalyzer), 1);

        let validation = gateway.validate(Path::new("x.jpg")).await;
        assert!(!validation.has_face);
        assert!(validation.message.starts_with("Face validation error"));

        let recognition = gateway.recognize(Path::new("x.jpg")).await;
        assert!(matches!(recognition, Recognition::Error { .. }));
    }

    struct SlowAnalyzer {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FaceAnalyzer for SlowAnalyzer {
        fn validate(&self, _image: &Path) -> Validation {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Validation::from_confidences(&[0.9])
        }
        fn recognize(&self, _image: &Path) -> Recognition {
            Recognition::Denied
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_permits_bound_concurrency() {
        let analyzer = Arc::new(SlowAnalyzer {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let gateway = FaceAnalysisGateway::new(analyzer.clone(), 2);

        let calls: Vec<_> = (0..6)
            .map(|_| {
                let gateway = gateway.clone();
                tokio::spawn(async move { gateway.validate(Path::new("x.jpg")).await })
            })
            .collect();
        for call in calls {
            assert!(call.await.unwrap().has_face);
        }

        assert!(analyzer.peak.load(Ordering::SeqCst) <= 2);
    }
}
