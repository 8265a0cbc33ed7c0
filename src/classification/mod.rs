pub mod mobilenet;

use image::DynamicImage;

use crate::error::PipelineError;
use crate::models::{CellType, ClassificationOutcome};

pub use mobilenet::MobileNetClassifier;

/// Edge of the square the classifier sees.
pub const CLASSIFIER_INPUT_SIZE: u32 = 224;

/// Assigns a cell type to one cropped region.
///
/// Shared read-only across runs and threads. Classifying the same pixels twice
/// must give the same answer.
pub trait RegionClassifier: Send + Sync {
    fn classify(&self, crop: &DynamicImage) -> Result<ClassificationOutcome, PipelineError>;

    /// Human-readable name (used in log output)
    fn name(&self) -> &str;
}

/// Reject crops that cannot be resized. Must run before any preprocessing.
pub fn ensure_non_empty(crop: &DynamicImage) -> Result<(), PipelineError> {
    if crop.width() == 0 || crop.height() == 0 {
        return Err(PipelineError::EmptyRegion {
            width: crop.width(),
            height: crop.height(),
        });
    }
    Ok(())
}

pub fn round_confidence(p: f32) -> f32 {
    (p * 1000.0).round() / 1000.0
}

/// Pick the most probable cell type. Ties go to the lower vocabulary index.
pub fn select_top(probabilities: &[f32]) -> Result<ClassificationOutcome, PipelineError> {
    if probabilities.len() != CellType::ALL.len() {
        return Err(PipelineError::inference(format!(
            "classifier produced {} scores for {} cell types",
            probabilities.len(),
            CellType::ALL.len()
        )));
    }

    if let Some(i) = probabilities.iter().position(|p| !p.is_finite()) {
        return Err(PipelineError::inference(format!(
            "classifier score {} for {} is not finite",
            probabilities[i],
            CellType::ALL[i]
        )));
    }

    let mut best = 0;
    for (i, p) in probabilities.iter().enumerate().skip(1) {
        if *p > probabilities[best] {
            best = i;
        }
    }

    let label = CellType::from_index(best)
        .ok_or_else(|| PipelineError::inference(format!("no cell type at index {best}")))?;
    Ok(ClassificationOutcome {
        label,
        confidence: round_confidence(probabilities[best].clamp(0.0, 1.0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probs_with(index: usize, p: f32) -> Vec<f32> {
        let mut probs = vec![0.01; 12];
        probs[index] = p;
        probs
    }

    #[test]
    fn test_select_top_picks_max_and_rounds() {
        let outcome = select_top(&probs_with(5, 0.87349)).unwrap();
        assert_eq!(outcome.label, CellType::Lymphocyte);
        assert_eq!(outcome.confidence, 0.873);
    }

    #[test]
    fn test_select_top_first_argmax_on_tie() {
        let mut probs = vec![0.0; 12];
        probs[3] = 0.4;
        probs[9] = 0.4;
        let outcome = select_top(&probs).unwrap();
        assert_eq!(outcome.label, CellType::Blast);
    }

    #[test]
    fn test_select_top_rejects_non_finite_scores() {
        let mut probs = probs_with(5, 0.9);
        probs[0] = f32::NAN;
        let err = select_top(&probs).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
        assert!(err.is_region_level());

        let mut probs = probs_with(2, 0.6);
        probs[7] = f32::NAN;
        assert!(matches!(select_top(&probs), Err(PipelineError::Inference(_))));

        let mut probs = probs_with(2, 0.6);
        probs[11] = f32::INFINITY;
        assert!(matches!(select_top(&probs), Err(PipelineError::Inference(_))));
    }

    #[test]
    fn test_select_top_wrong_length() {
        assert!(matches!(select_top(&[0.5; 11]), Err(PipelineError::Inference(_))));
    }

    #[test]
    fn test_ensure_non_empty() {
        assert!(ensure_non_empty(&DynamicImage::new_rgb8(4, 4)).is_ok());
        let err = ensure_non_empty(&DynamicImage::new_rgb8(0, 4)).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyRegion { width: 0, height: 4 }));
        assert!(ensure_non_empty(&DynamicImage::new_rgb8(4, 0)).is_err());
    }
}
