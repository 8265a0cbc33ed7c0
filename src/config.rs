//! Pipeline configuration.
//!
//! Defaults are overridden by `LEUKOSCAN_*` environment variables, which the
//! binary in turn lets command line flags override.

use std::path::PathBuf;
use std::time::Duration;

use image::Rgb;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub const DEFAULT_CONF_THRESHOLD: f32 = 0.9;

const ROI_DIR_NAME: &str = "roi";
const ANNOTATED_DIR_NAME: &str = "annotated";
const DB_FILE_NAME: &str = "leukoscan.db";

/// Tensor axis order expected by the classifier model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[batch, height, width, channels]`, what Keras exports.
    #[default]
    Nhwc,
    /// `[batch, channels, height, width]`
    Nchw,
}

impl std::str::FromStr for TensorLayout {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nhwc" => Ok(TensorLayout::Nhwc),
            "nchw" => Ok(TensorLayout::Nchw),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown tensor layout '{other}' (expected nhwc or nchw)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the `.rten` region detector.
    pub detector_path: PathBuf,
    /// Path to the `.rten` cell-type classifier.
    pub classifier_path: PathBuf,
    /// Names of the detector's output classes, in output order.
    pub detector_classes: Vec<String>,
    /// Square input edge the detector was exported with.
    pub detector_input_size: u32,
    pub nms_iou_threshold: f32,
    pub max_detections: usize,
    pub classifier_layout: TensorLayout,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector_path: PathBuf::from("models/detector.rten"),
            classifier_path: PathBuf::from("models/classifier.rten"),
            detector_classes: vec!["WBC".to_string()],
            detector_input_size: 640,
            nms_iou_threshold: 0.7,
            max_detections: 300,
            classifier_layout: TensorLayout::Nhwc,
        }
    }
}

/// Where artifacts and records live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn roi_dir(&self) -> PathBuf {
        self.data_dir.join(ROI_DIR_NAME)
    }

    pub fn annotated_dir(&self) -> PathBuf {
        self.data_dir.join(ANNOTATED_DIR_NAME)
    }

    pub fn db_file(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new("media")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderStyle {
    pub box_color: [u8; 3],
    pub thickness: u32,
    pub font_path: Option<PathBuf>,
    pub font_scale: f32,
}

impl RenderStyle {
    pub fn color(&self) -> Rgb<u8> {
        Rgb(self.box_color)
    }
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            box_color: [0, 255, 0],
            thickness: 2,
            font_path: None,
            font_scale: 16.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Detection confidence cutoff τ. Regions scoring below it are dropped.
    pub conf_threshold: f32,
    /// Overall budget for one run.
    pub deadline: Duration,
    /// Upper bound on regions classified concurrently.
    pub workers: usize,
    pub models: ModelConfig,
    pub storage: StorageConfig,
    pub render: RenderStyle,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            conf_threshold: DEFAULT_CONF_THRESHOLD,
            deadline: Duration::from_secs(120),
            workers: 1,
            models: ModelConfig::default(),
            storage: StorageConfig::default(),
            render: RenderStyle::default(),
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables, falling back to defaults for unset ones.
    ///
    /// A variable that is set but does not parse is an error.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "LEUKOSCAN_CONF_THRESHOLD")? {
            config.conf_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "LEUKOSCAN_DEADLINE_SECS")? {
            config.deadline = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "LEUKOSCAN_WORKERS")? {
            config.workers = v;
        }
        if let Some(v) = lookup("LEUKOSCAN_DETECTOR_MODEL") {
            config.models.detector_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LEUKOSCAN_CLASSIFIER_MODEL") {
            config.models.classifier_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LEUKOSCAN_CLASSIFIER_LAYOUT") {
            config.models.classifier_layout = v.parse()?;
        }
        if let Some(v) = lookup("LEUKOSCAN_DETECTOR_CLASSES") {
            config.models.detector_classes = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("LEUKOSCAN_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LEUKOSCAN_FONT") {
            config.render.font_path = Some(PathBuf::from(v));
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "confidence threshold {} is outside [0, 1]",
                self.conf_threshold
            )));
        }
        if self.workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "at least one classification worker is required".to_string(),
            ));
        }
        if self.deadline.is_zero() {
            return Err(PipelineError::InvalidConfig("deadline must be positive".to_string()));
        }
        if self.models.detector_classes.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "detector needs at least one class name".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.models.nms_iou_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "NMS IoU threshold {} is outside [0, 1]",
                self.models.nms_iou_threshold
            )));
        }
        Ok(())
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, PipelineError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e| {
                PipelineError::InvalidConfig(format!("{key}={raw:?} does not parse: {e}"))
            })
        })
        .transpose()
}
