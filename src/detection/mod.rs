pub mod nms;
pub mod preprocessing;
pub mod yolo;

use image::DynamicImage;

use crate::error::PipelineError;
use crate::models::DetectedRegion;

pub use yolo::YoloDetector;

/// Finds candidate cell regions in a full smear image.
///
/// Implementations are loaded once and shared across runs and threads, so
/// `detect` must not mutate state.
pub trait RegionDetector: Send + Sync {
    /// Regions scoring at least `threshold`, in the detector's own emission order.
    fn detect(&self, image: &DynamicImage, threshold: f32)
    -> Result<Vec<DetectedRegion>, PipelineError>;

    /// Human-readable name (used in log output)
    fn name(&self) -> &str;
}

/// Drop regions scoring below `threshold`, keeping the order of the rest.
pub fn retain_confident(mut regions: Vec<DetectedRegion>, threshold: f32) -> Vec<DetectedRegion> {
    regions.retain(|r| r.confidence >= threshold);
    regions
}
