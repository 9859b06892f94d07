// Core modules
pub mod common;
pub mod core;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use common::{Config, FaceGateError, GracePolicy, Result};
pub use core::{FaceAnalysisGateway, FaceAnalyzer, OnnxFaceAnalyzer, Recognition, Validation};
pub use service::{CardRegistry, PhotoContext, StatusHub};
pub use storage::{IdentityStore, TempFileManager};
