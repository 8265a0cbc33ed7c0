use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use leukoscan::annotation::AnnotationRenderer;
use leukoscan::config::{RenderStyle, StorageConfig};
use leukoscan::core::db::ArtifactDb;
use leukoscan::core::store::{ArtifactKind, ArtifactStore, NewRecord, NewRun, StoreError};
use leukoscan::{
    BoundingBox, CellType, ClassificationOutcome, DetectedRegion, InferenceServices, Pipeline,
    PipelineError, RegionClassifier, RegionDetector, RunId,
};
use tempfile::TempDir;

pub const TEST_WIDTH: u32 = 640;
pub const TEST_HEIGHT: u32 = 480;
pub const SMEAR_BACKGROUND: Rgb<u8> = Rgb([200, 190, 210]);

/// Encodes a plain 640x480 grey smear as PNG bytes.
pub fn make_test_image_bytes() -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(TEST_WIDTH, TEST_HEIGHT, SMEAR_BACKGROUND));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .expect("Failed to encode test image");
    buf.into_inner()
}

pub fn region(x1: i32, y1: i32, x2: i32, y2: i32, confidence: f32) -> DetectedRegion {
    DetectedRegion {
        bbox: BoundingBox::new(x1, y1, x2, y2),
        class_hint: "WBC".to_string(),
        confidence,
    }
}

/// Detector that returns a fixed list of regions, honouring the threshold.
pub struct FakeDetector {
    regions: Vec<DetectedRegion>,
    delay: Duration,
}

impl FakeDetector {
    pub fn new(regions: Vec<DetectedRegion>) -> Self {
        Self {
            regions,
            delay: Duration::ZERO,
        }
    }

    /// Blocks for `delay` before answering.
    pub fn slow(regions: Vec<DetectedRegion>, delay: Duration) -> Self {
        Self { regions, delay }
    }
}

impl RegionDetector for FakeDetector {
    fn detect(&self, _image: &DynamicImage, threshold: f32) -> Result<Vec<DetectedRegion>, PipelineError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(self
            .regions
            .iter()
            .filter(|r| r.confidence >= threshold)
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "fake detector"
    }
}

/// Classifier whose label is a function of crop width, so results are reproducible.
///
/// Wider crops take longer, which shuffles completion order when several
/// workers run at once.
pub struct FakeClassifier {
    pub unavailable: bool,
}

impl FakeClassifier {
    pub fn new() -> Self {
        Self { unavailable: false }
    }

    pub fn label_for_width(width: u32) -> CellType {
        CellType::ALL[width as usize % CellType::ALL.len()]
    }
}

impl RegionClassifier for FakeClassifier {
    fn classify(&self, crop: &DynamicImage) -> Result<ClassificationOutcome, PipelineError> {
        if self.unavailable {
            return Err(PipelineError::model_unavailable("classifier weights missing"));
        }
        leukoscan::classification::ensure_non_empty(crop)?;
        std::thread::sleep(Duration::from_millis(crop.width() as u64 / 4));
        Ok(ClassificationOutcome {
            label: Self::label_for_width(crop.width()),
            confidence: 0.875,
        })
    }

    fn name(&self) -> &str {
        "fake classifier"
    }
}

pub fn fake_services(regions: Vec<DetectedRegion>) -> InferenceServices {
    InferenceServices::new(
        Arc::new(FakeDetector::new(regions)),
        Arc::new(FakeClassifier::new()),
    )
}

/// Creates an ArtifactDb rooted in a temporary directory.
/// Returns both the store and the temp directory (which must be kept alive).
pub async fn create_test_store() -> (ArtifactDb, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let store = ArtifactDb::new(&StorageConfig::new(dir.path()))
        .await
        .expect("Failed to create test store");
    (store, dir)
}

pub fn test_renderer() -> AnnotationRenderer {
    AnnotationRenderer::new(RenderStyle::default()).expect("Failed to create renderer")
}

/// Builds a pipeline over fake models and a fresh temporary store.
pub async fn create_test_pipeline(
    regions: Vec<DetectedRegion>,
) -> (Pipeline<ArtifactDb>, TempDir) {
    let (store, dir) = create_test_store().await;
    let pipeline = Pipeline::new(&fake_services(regions), test_renderer(), store);
    (pipeline, dir)
}

/// Store that refuses to save images whose name contains a given fragment.
#[derive(Clone)]
pub struct FailingStore {
    pub inner: ArtifactDb,
    fail_on: Arc<Mutex<Vec<String>>>,
}

impl FailingStore {
    pub fn new(inner: ArtifactDb) -> Self {
        Self {
            inner,
            fail_on: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn fail_names_containing(&self, fragment: &str) {
        self.fail_on
            .lock()
            .expect("fail list poisoned")
            .push(fragment.to_string());
    }

    fn should_fail(&self, name: &str) -> bool {
        self.fail_on
            .lock()
            .expect("fail list poisoned")
            .iter()
            .any(|f| name.contains(f.as_str()))
    }
}

impl ArtifactStore for FailingStore {
    async fn save_image(
        &self,
        kind: ArtifactKind,
        bytes: &[u8],
        suggested_name: &str,
    ) -> Result<String, StoreError> {
        if self.should_fail(suggested_name) {
            return Err(StoreError::Io(std::io::Error::other(format!(
                "disk full while writing {suggested_name}"
            ))));
        }
        self.inner.save_image(kind, bytes, suggested_name).await
    }

    async fn create_run(&self, run: &NewRun) -> Result<(), StoreError> {
        self.inner.create_run(run).await
    }

    async fn create_record(&self, record: &NewRecord) -> Result<i64, StoreError> {
        self.inner.create_record(record).await
    }

    async fn attach_overview(&self, run_id: RunId, overview_ref: &str) -> Result<(), StoreError> {
        self.inner.attach_overview(run_id, overview_ref).await
    }
}

/// Number of files under the given artifact directory.
pub fn count_files(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0)
}

/// Pixels in the given window that read as the green annotation colour,
/// tolerant of JPEG chroma blur.
pub fn count_box_colored(
    img: &DynamicImage,
    xs: std::ops::Range<u32>,
    ys: std::ops::Range<u32>,
) -> usize {
    let rgb = img.to_rgb8();
    ys.flat_map(|y| xs.clone().map(move |x| (x, y)))
        .filter(|&(x, y)| {
            let px = rgb.get_pixel(x, y);
            let (r, g, b) = (px[0] as i32, px[1] as i32, px[2] as i32);
            g - r > 30 && g - b > 30
        })
        .count()
}

/// Largest per-channel difference between two images of equal size.
pub fn max_pixel_difference(a: &DynamicImage, b: &DynamicImage) -> u8 {
    let (a, b) = (a.to_rgb8(), b.to_rgb8());
    assert_eq!(a.dimensions(), b.dimensions());
    a.pixels()
        .zip(b.pixels())
        .flat_map(|(p, q)| (0..3).map(move |c| p[c].abs_diff(q[c])))
        .max()
        .unwrap_or(0)
}
