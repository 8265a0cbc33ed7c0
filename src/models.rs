use std::fmt;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RegionFailure;

/// Axis-aligned box in source image pixel coordinates.
///
/// Boxes come straight from the detector, so nothing here guarantees
/// `x1 < x2` or that the box lies inside the image. Callers check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> u32 {
        (self.x2 as i64 - self.x1 as i64).clamp(0, u32::MAX as i64) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 as i64 - self.y1 as i64).clamp(0, u32::MAX as i64) as u32
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// True when the whole box lies inside a `width`x`height` image and has positive area.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x1 >= 0
            && self.y1 >= 0
            && self.x1 < self.x2
            && self.y1 < self.y2
            && self.x2 as i64 <= width as i64
            && self.y2 as i64 <= height as i64
    }

    /// Intersect with the image rectangle, returning `(x, y, width, height)` for cropping.
    /// A box that misses the image entirely yields a zero-sized rectangle.
    pub fn clip_to(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let clamp_x = |v: i32| (v.max(0) as u32).min(width);
        let clamp_y = |v: i32| (v.max(0) as u32).min(height);
        let (x1, x2) = (clamp_x(self.x1), clamp_x(self.x2));
        let (y1, y2) = (clamp_y(self.y1), clamp_y(self.y2));
        (x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}

/// A candidate cell region as emitted by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedRegion {
    pub bbox: BoundingBox,
    /// Detector's own class name. Informational only.
    pub class_hint: String,
    pub confidence: f32,
}

impl DetectedRegion {
    /// Crop the region out of `img`, clipped to the image bounds.
    pub fn crop(&self, img: &DynamicImage) -> DynamicImage {
        let (x, y, width, height) = self.bbox.clip_to(img.width(), img.height());
        img.crop_imm(x, y, width, height)
    }
}

/// White-blood-cell subtypes the classifier distinguishes, in model output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellType {
    #[serde(rename = "Atypical lymphocyte")]
    AtypicalLymphocyte,
    #[serde(rename = "Band Neutrophil")]
    BandNeutrophil,
    Basophil,
    Blast,
    Eosinophil,
    Lymphocyte,
    Metamyelocyte,
    Monocyte,
    Myelocyte,
    #[serde(rename = "NRC")]
    Nrc,
    Promyelocyte,
    #[serde(rename = "Segmented neutrophil")]
    SegmentedNeutrophil,
}

impl CellType {
    pub const ALL: [CellType; 12] = [
        CellType::AtypicalLymphocyte,
        CellType::BandNeutrophil,
        CellType::Basophil,
        CellType::Blast,
        CellType::Eosinophil,
        CellType::Lymphocyte,
        CellType::Metamyelocyte,
        CellType::Monocyte,
        CellType::Myelocyte,
        CellType::Nrc,
        CellType::Promyelocyte,
        CellType::SegmentedNeutrophil,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            CellType::AtypicalLymphocyte => "Atypical lymphocyte",
            CellType::BandNeutrophil => "Band Neutrophil",
            CellType::Basophil => "Basophil",
            CellType::Blast => "Blast",
            CellType::Eosinophil => "Eosinophil",
            CellType::Lymphocyte => "Lymphocyte",
            CellType::Metamyelocyte => "Metamyelocyte",
            CellType::Monocyte => "Monocyte",
            CellType::Myelocyte => "Myelocyte",
            CellType::Nrc => "NRC",
            CellType::Promyelocyte => "Promyelocyte",
            CellType::SegmentedNeutrophil => "Segmented neutrophil",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationOutcome {
    pub label: CellType,
    /// Probability of `label`, rounded to 3 decimals.
    pub confidence: f32,
}

/// Identity of the patient that owns the records of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientRef(pub i64);

impl fmt::Display for PatientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier generated for every pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 hex digits, used to keep artifact names unique across runs.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One successfully classified and persisted region of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionResult {
    /// Zero-based position in detector emission order.
    pub index: usize,
    pub record_id: i64,
    pub image_ref: String,
    pub label: CellType,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub detection_confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: RunId,
    pub regions: Vec<RegionResult>,
    pub overview_ref: String,
    /// Regions that were skipped or only partially handled, in detection order.
    pub failures: Vec<RegionFailure>,
}
