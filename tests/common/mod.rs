mod fixtures;
pub use fixtures::*;

// Re-export commonly used types from leukoscan for tests
pub use leukoscan::core::store::{ArtifactStore, ClassificationRecord, RecordRepository};
pub use leukoscan::{
    ArtifactDb, BoundingBox, CellType, ErrorKind, PatientRef, Pipeline, PipelineError,
    PipelineResult, PipelineState,
};
