use image::DynamicImage;
use rten::Model;
use rten_tensor::NdTensor;
use rten_tensor::prelude::*;
use tracing::debug;

use crate::config::ModelConfig;
use crate::detection::nms::{Candidate, non_max_suppression};
use crate::detection::preprocessing::{Letterbox, letterbox, to_nchw_tensor};
use crate::detection::{RegionDetector, retain_confident};
use crate::error::PipelineError;
use crate::models::{BoundingBox, DetectedRegion};

/// Decode a YOLOv8 style prediction tensor.
///
/// `shape` is `[1, 4 + classes, anchors]`, or `[1, anchors, 4 + classes]` for
/// exports that transpose the head. Each anchor holds a centre/size box in
/// detector input space followed by one score per class. Anchors whose best
/// class score is below `threshold` are dropped.
pub fn decode_predictions(
    data: &[f32],
    shape: [usize; 3],
    num_classes: usize,
    threshold: f32,
) -> Result<Vec<Candidate>, PipelineError> {
    let attrs = 4 + num_classes;
    let (anchors, channel_major) = match shape {
        [1, a, n] if a == attrs => (n, true),
        [1, n, a] if a == attrs => (n, false),
        other => {
            return Err(PipelineError::inference(format!(
                "detector output shape {other:?} does not fit {num_classes} classes"
            )));
        }
    };
    if data.len() != attrs * anchors {
        return Err(PipelineError::inference(format!(
            "detector output holds {} values, expected {}",
            data.len(),
            attrs * anchors
        )));
    }

    let at = |attr: usize, anchor: usize| {
        if channel_major {
            data[attr * anchors + anchor]
        } else {
            data[anchor * attrs + attr]
        }
    };

    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let mut class_id = 0;
        let mut confidence = at(4, anchor);
        for class in 1..num_classes {
            let score = at(4 + class, anchor);
            if score > confidence {
                class_id = class;
                confidence = score;
            }
        }
        if confidence < threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
        candidates.push(Candidate {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
            class_id,
            confidence,
        });
    }
    Ok(candidates)
}

/// Map a candidate from detector input space onto integer source pixels, clipped to the image.
fn to_source_box(candidate: &Candidate, lb: &Letterbox, width: u32, height: u32) -> BoundingBox {
    let (x1, y1) = lb.unmap(candidate.x1, candidate.y1);
    let (x2, y2) = lb.unmap(candidate.x2, candidate.y2);
    let clip_x = |v: f32| v.clamp(0.0, width as f32) as i32;
    let clip_y = |v: f32| v.clamp(0.0, height as f32) as i32;
    BoundingBox::new(clip_x(x1), clip_y(y1), clip_x(x2), clip_y(y2))
}

/// Region detector backed by a YOLOv8 model converted to `.rten`.
pub struct YoloDetector {
    model: Model,
    classes: Vec<String>,
    input_size: u32,
    iou_threshold: f32,
    max_detections: usize,
}

impl YoloDetector {
    pub fn load(config: &ModelConfig) -> Result<Self, PipelineError> {
        let path = &config.detector_path;
        if !path.is_file() {
            return Err(PipelineError::model_unavailable(format!(
                "detector model not found at {}",
                path.display()
            )));
        }
        let model = Model::load_file(path).map_err(|e| {
            PipelineError::model_unavailable(format!(
                "failed to load detector {}: {e}",
                path.display()
            ))
        })?;

        Ok(Self {
            model,
            classes: config.detector_classes.clone(),
            input_size: config.detector_input_size,
            iou_threshold: config.nms_iou_threshold,
            max_detections: config.max_detections,
        })
    }

    fn class_name(&self, class_id: usize) -> String {
        self.classes
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }
}

impl RegionDetector for YoloDetector {
    fn detect(
        &self,
        image: &DynamicImage,
        threshold: f32,
    ) -> Result<Vec<DetectedRegion>, PipelineError> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(PipelineError::invalid_image(format!(
                "cannot detect on a {width}x{height} image"
            )));
        }

        let (canvas, lb) = letterbox(image, self.input_size);
        let input = to_nchw_tensor(&canvas);

        let output = self
            .model
            .run_one(input.view().into(), None)
            .map_err(|e| PipelineError::inference(format!("detector run failed: {e}")))?;
        let output: NdTensor<f32, 3> = output
            .try_into()
            .map_err(|e| PipelineError::inference(format!("unexpected detector output: {e}")))?;

        let candidates =
            decode_predictions(&output.to_vec(), output.shape(), self.classes.len(), threshold)?;
        let kept = non_max_suppression(candidates, self.iou_threshold, self.max_detections);
        debug!("Detector kept {} boxes at threshold {:.2}", kept.len(), threshold);

        let regions = kept
            .iter()
            .map(|c| DetectedRegion {
                bbox: to_source_box(c, &lb, width, height),
                class_hint: self.class_name(c.class_id),
                confidence: c.confidence,
            })
            .collect();
        Ok(retain_confident(regions, threshold))
    }

    fn name(&self) -> &str {
        "YOLO region detector"
    }
}
