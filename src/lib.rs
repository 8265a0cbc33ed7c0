pub mod annotation;
pub mod classification;
pub mod config;
pub mod core;
pub mod detection;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;

pub use annotation::{Annotation, AnnotationRenderer};
pub use classification::RegionClassifier;
pub use config::PipelineConfig;
pub use core::db::ArtifactDb;
pub use core::store::{ArtifactStore, RecordRepository};
pub use detection::RegionDetector;
pub use error::{ErrorKind, PipelineError, RegionFailure};
pub use models::{
    BoundingBox, CellType, ClassificationOutcome, DetectedRegion, PatientRef, PipelineResult,
    RegionResult, RunId,
};
pub use pipeline::{Pipeline, PipelineState, RunTrace};
pub use services::InferenceServices;
