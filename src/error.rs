//! Error taxonomy for the detect-then-classify pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::store::StoreError;
use crate::models::BoundingBox;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("empty region: crop is {width}x{height}")]
    EmptyRegion { width: u32, height: u32 },

    #[error("render skipped: box {bbox} is outside the {width}x{height} image")]
    RenderSkipped {
        bbox: BoundingBox,
        width: u32,
        height: u32,
    },

    #[error("pipeline exceeded its deadline of {0:?}")]
    Timeout(Duration),

    #[error("storage failure: {0}")]
    StorageFailure(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    pub fn invalid_image(msg: impl Into<String>) -> Self {
        Self::InvalidImage(msg.into())
    }

    pub fn model_unavailable(msg: impl Into<String>) -> Self {
        Self::ModelUnavailable(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidImage(_) => ErrorKind::InvalidImage,
            PipelineError::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            PipelineError::Inference(_) => ErrorKind::Inference,
            PipelineError::EmptyRegion { .. } => ErrorKind::EmptyRegion,
            PipelineError::RenderSkipped { .. } => ErrorKind::RenderSkipped,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
            PipelineError::StorageFailure(_) => ErrorKind::StorageFailure,
            PipelineError::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    /// Whether the caller may retry the whole run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Timeout(_))
    }

    /// Errors that only ever cost a single region and never abort a run.
    pub fn is_region_level(&self) -> bool {
        matches!(
            self,
            PipelineError::EmptyRegion { .. }
                | PipelineError::RenderSkipped { .. }
                | PipelineError::StorageFailure(_)
                | PipelineError::Inference(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidImage,
    ModelUnavailable,
    Inference,
    EmptyRegion,
    RenderSkipped,
    Timeout,
    StorageFailure,
    InvalidConfig,
}

/// A region that was dropped from the output or not drawn on the overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionFailure {
    /// Zero-based position in detector emission order.
    pub index: usize,
    pub bbox: BoundingBox,
    pub kind: ErrorKind,
    pub message: String,
}

impl RegionFailure {
    pub fn new(index: usize, bbox: BoundingBox, err: &PipelineError) -> Self {
        Self {
            index,
            bbox,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
