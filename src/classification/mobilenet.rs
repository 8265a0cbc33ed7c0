use image::{DynamicImage, imageops::FilterType};
use rten::Model;
use rten_tensor::NdTensor;
use rten_tensor::prelude::*;

use crate::classification::{CLASSIFIER_INPUT_SIZE, RegionClassifier, ensure_non_empty, select_top};
use crate::config::{ModelConfig, TensorLayout};
use crate::error::PipelineError;
use crate::models::ClassificationOutcome;

/// Resize to the canonical square, scale pixels by 1/255 and add a batch axis.
///
/// Nearest-neighbour resampling matches how the model was fed during training.
pub fn preprocess(crop: &DynamicImage, layout: TensorLayout) -> NdTensor<f32, 4> {
    let size = CLASSIFIER_INPUT_SIZE;
    let rgb = image::imageops::resize(&crop.to_rgb8(), size, size, FilterType::Nearest);
    let side = size as usize;
    let plane = side * side;
    let mut data = vec![0f32; 3 * plane];

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            let offset = match layout {
                TensorLayout::Nhwc => (y * side + x) * 3 + c,
                TensorLayout::Nchw => c * plane + y * side + x,
            };
            data[offset] = value;
        }
    }

    let shape = match layout {
        TensorLayout::Nhwc => [1, side, side, 3],
        TensorLayout::Nchw => [1, 3, side, side],
    };
    NdTensor::from_data(shape, data)
}

/// Cell-type classifier backed by a MobileNet model converted to `.rten`.
pub struct MobileNetClassifier {
    model: Model,
    layout: TensorLayout,
}

impl MobileNetClassifier {
    pub fn load(config: &ModelConfig) -> Result<Self, PipelineError> {
        let path = &config.classifier_path;
        if !path.is_file() {
            return Err(PipelineError::model_unavailable(format!(
                "classifier model not found at {}",
                path.display()
            )));
        }
        let model = Model::load_file(path).map_err(|e| {
            PipelineError::model_unavailable(format!(
                "failed to load classifier {}: {e}",
                path.display()
            ))
        })?;

        Ok(Self {
            model,
            layout: config.classifier_layout,
        })
    }
}

impl RegionClassifier for MobileNetClassifier {
    fn classify(&self, crop: &DynamicImage) -> Result<ClassificationOutcome, PipelineError> {
        ensure_non_empty(crop)?;
        let input = preprocess(crop, self.layout);

        let output = self
            .model
            .run_one(input.view().into(), None)
            .map_err(|e| PipelineError::inference(format!("classifier run failed: {e}")))?;
        let output: NdTensor<f32, 2> = output
            .try_into()
            .map_err(|e| PipelineError::inference(format!("unexpected classifier output: {e}")))?;

        select_top(&output.to_vec())
    }

    fn name(&self) -> &str {
        "MobileNet cell classifier"
    }
}
