pub mod config;
pub mod error;
pub mod time;

pub use config::{Config, GracePolicy};
pub use error::{FaceGateError, Result};
