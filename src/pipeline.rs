use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::annotation::{Annotation, AnnotationRenderer};
use crate::classification::RegionClassifier;
use crate::config::{DEFAULT_CONF_THRESHOLD, PipelineConfig};
use crate::core::store::{ArtifactKind, ArtifactStore, NewRecord, NewRun, StoreError};
use crate::detection::{RegionDetector, retain_confident};
use crate::error::{ErrorKind, PipelineError, RegionFailure};
use crate::models::{
    ClassificationOutcome, DetectedRegion, PatientRef, PipelineResult, RegionResult, RunId,
};
use crate::services::InferenceServices;

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Decoding,
    Detecting,
    /// Working on region `index` (1-based) of `total`.
    ClassifyingRegions { index: usize, total: usize },
    Rendering,
    Persisting,
    Done,
    Failed(ErrorKind),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed(_))
    }

    pub fn can_advance_to(&self, next: &PipelineState) -> bool {
        use PipelineState::*;
        match (*self, *next) {
            (Idle, Decoding) => true,
            (Decoding, Detecting) => true,
            (Detecting, ClassifyingRegions { index, total }) => index == 1 && total >= 1,
            (Detecting, Rendering) => true,
            (
                ClassifyingRegions { index: a, total: t },
                ClassifyingRegions { index: b, total: u },
            ) => t == u && b == a + 1 && b <= u,
            (ClassifyingRegions { index, total }, Rendering) => index == total,
            (Rendering, Persisting) => true,
            (Persisting, Done) => true,
            (Idle, Failed(_)) => false,
            (state, Failed(_)) => !state.is_terminal(),
            _ => false,
        }
    }
}

/// Ordered state history of one run.
#[derive(Debug, Clone)]
pub struct RunTrace {
    run_id: RunId,
    states: Vec<PipelineState>,
}

impl RunTrace {
    fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            states: vec![PipelineState::Idle],
        }
    }

    fn advance(&mut self, next: PipelineState) {
        let current = self.current();
        debug_assert!(current.can_advance_to(&next), "illegal transition {current:?} -> {next:?}");
        debug!("Run {}: {:?} -> {:?}", self.run_id, current, next);
        self.states.push(next);
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn current(&self) -> PipelineState {
        self.states.last().copied().unwrap_or(PipelineState::Idle)
    }

    pub fn states(&self) -> &[PipelineState] {
        &self.states
    }

    /// Every recorded step was a legal transition.
    pub fn is_valid(&self) -> bool {
        self.states.windows(2).all(|w| w[0].can_advance_to(&w[1]))
    }
}

/// Decode uploaded bytes into pixels.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::invalid_image(format!("cannot decode upload: {e}")))?;
    if img.width() == 0 || img.height() == 0 {
        return Err(PipelineError::invalid_image(format!(
            "decoded image is {}x{}",
            img.width(),
            img.height()
        )));
    }
    Ok(img)
}

/// File stem used to derive artifact names from the uploaded file name.
pub fn artifact_stem(source_name: &str) -> String {
    Path::new(source_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("upload")
        .to_string()
}

pub fn region_artifact_name(stem: &str, run_id: &RunId, index: usize) -> String {
    format!("{stem}_{}_{}.jpg", run_id.short(), index + 1)
}

pub fn overview_artifact_name(stem: &str, run_id: &RunId) -> String {
    format!("{stem}_{}_annotated.jpg", run_id.short())
}

fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>, StoreError> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut buf, ImageFormat::Jpeg)?;
    Ok(buf.into_inner())
}

type Classified = Result<(DynamicImage, ClassificationOutcome), PipelineError>;

/// Identity shared by every artifact and record written for one run.
struct RunContext<'a> {
    run_id: RunId,
    patient: PatientRef,
    stem: &'a str,
}

/// Detect, classify, annotate and persist one smear image.
pub struct Pipeline<S: ArtifactStore> {
    detector: Arc<dyn RegionDetector>,
    classifier: Arc<dyn RegionClassifier>,
    renderer: Arc<AnnotationRenderer>,
    store: S,
    conf_threshold: f32,
    deadline: Duration,
    workers: usize,
}

impl<S: ArtifactStore> Pipeline<S> {
    pub fn new(services: &InferenceServices, renderer: AnnotationRenderer, store: S) -> Self {
        Self {
            detector: services.detector.clone(),
            classifier: services.classifier.clone(),
            renderer: Arc::new(renderer),
            store,
            conf_threshold: DEFAULT_CONF_THRESHOLD,
            deadline: Duration::from_secs(120),
            workers: 1,
        }
    }

    /// Apply threshold, deadline and worker count from `config`.
    pub fn with_config(self, config: &PipelineConfig) -> Self {
        self.with_threshold(config.conf_threshold)
            .with_deadline(config.deadline)
            .with_workers(config.workers)
    }

    pub fn with_threshold(mut self, conf_threshold: f32) -> Self {
        self.conf_threshold = conf_threshold;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run the whole pipeline for one uploaded image.
    pub async fn run(
        &self,
        image_bytes: &[u8],
        source_name: &str,
        patient: PatientRef,
    ) -> Result<PipelineResult, PipelineError> {
        self.run_traced(image_bytes, source_name, patient).await.0
    }

    /// Like [`Pipeline::run`], also returning the state history.
    pub async fn run_traced(
        &self,
        image_bytes: &[u8],
        source_name: &str,
        patient: PatientRef,
    ) -> (Result<PipelineResult, PipelineError>, RunTrace) {
        let run_id = RunId::new();
        let mut trace = RunTrace::new(run_id);
        info!("Run {}: analysing '{}' for patient {}", run_id, source_name, patient);

        let outcome = tokio::time::timeout(
            self.deadline,
            self.execute(&mut trace, image_bytes, source_name, patient),
        )
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                let err = PipelineError::Timeout(self.deadline);
                trace.advance(PipelineState::Failed(err.kind()));
                Err(err)
            }
        };

        match &result {
            Ok(res) => info!(
                "Run {}: done, {} regions classified, {} skipped",
                run_id,
                res.regions.len(),
                res.failures.len()
            ),
            Err(err) => warn!("Run {}: failed: {}", run_id, err),
        }
        (result, trace)
    }

    async fn execute(
        &self,
        trace: &mut RunTrace,
        image_bytes: &[u8],
        source_name: &str,
        patient: PatientRef,
    ) -> Result<PipelineResult, PipelineError> {
        let run_id = trace.run_id();

        trace.advance(PipelineState::Decoding);
        let image = Arc::new(fail_on(trace, decode_image(image_bytes))?);
        debug!("Run {}: decoded {}x{} image", run_id, image.width(), image.height());

        trace.advance(PipelineState::Detecting);
        let regions = fail_on(trace, self.detect(image.clone()).await)?;
        info!("Run {}: {} regions at or above {:.2}", run_id, regions.len(), self.conf_threshold);

        let total = regions.len();
        let classified = if total > 0 {
            trace.advance(PipelineState::ClassifyingRegions { index: 1, total });
            let mut classified = fail_on(trace, self.classify_all(image.clone(), &regions).await)?;
            // A model that vanished mid-run aborts before anything is written.
            if let Some(pos) = classified
                .iter()
                .position(|c| matches!(c, Err(PipelineError::ModelUnavailable(_))))
            {
                if let Err(err) = classified.swap_remove(pos) {
                    trace.advance(PipelineState::Failed(err.kind()));
                    return Err(err);
                }
            }
            classified
        } else {
            Vec::new()
        };

        fail_on(
            trace,
            self.store
                .create_run(&NewRun {
                    id: run_id,
                    patient,
                    source_name: source_name.to_string(),
                })
                .await
                .map_err(PipelineError::from),
        )?;

        let stem = artifact_stem(source_name);
        let ctx = RunContext {
            run_id,
            patient,
            stem: &stem,
        };
        let mut results = Vec::new();
        let mut annotations = Vec::new();
        let mut failures = Vec::new();

        for (index, (region, outcome)) in regions.iter().zip(classified).enumerate() {
            if index > 0 {
                trace.advance(PipelineState::ClassifyingRegions { index: index + 1, total });
            }
            let persisted = match outcome {
                Ok((crop, outcome)) => {
                    self.persist_region(&ctx, index, region, &crop, outcome).await
                }
                Err(err) => Err(err),
            };
            match persisted {
                Ok(result) => {
                    annotations.push(Annotation {
                        index,
                        bbox: region.bbox,
                        label: result.label,
                        confidence: result.confidence,
                    });
                    results.push(result);
                }
                Err(err) => {
                    warn!("Run {}: region {} skipped: {}", run_id, index + 1, err);
                    failures.push(RegionFailure::new(index, region.bbox, &err));
                }
            }
        }

        trace.advance(PipelineState::Rendering);
        let renderer = self.renderer.clone();
        let base = image.clone();
        let rendered = tokio::task::spawn_blocking(move || renderer.render(&base, &annotations))
            .await
            .map_err(|e| PipelineError::inference(format!("render task failed: {e}")));
        let rendered = fail_on(trace, rendered)?;
        failures.extend(rendered.skipped);
        failures.sort_by_key(|f| f.index);

        trace.advance(PipelineState::Persisting);
        let overview_ref = fail_on(
            trace,
            self.persist_overview(&ctx, &rendered.image).await,
        )?;

        trace.advance(PipelineState::Done);
        Ok(PipelineResult {
            run_id,
            regions: results,
            overview_ref,
            failures,
        })
    }

    async fn detect(&self, image: Arc<DynamicImage>) -> Result<Vec<DetectedRegion>, PipelineError> {
        let detector = self.detector.clone();
        let threshold = self.conf_threshold;
        debug!("Running {} at threshold {:.2}", detector.name(), threshold);
        let regions = tokio::task::spawn_blocking(move || detector.detect(&image, threshold))
            .await
            .map_err(|e| PipelineError::inference(format!("detection task failed: {e}")))??;
        Ok(retain_confident(regions, threshold))
    }

    /// Crop and classify every region on the blocking pool, at most `workers` at a time.
    /// Results come back in detection order.
    async fn classify_all(
        &self,
        image: Arc<DynamicImage>,
        regions: &[DetectedRegion],
    ) -> Result<Vec<Classified>, PipelineError> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for (index, region) in regions.iter().cloned().enumerate() {
            let image = image.clone();
            let classifier = self.classifier.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let classified = tokio::task::spawn_blocking(move || {
                    let crop = region.crop(&image);
                    classifier.classify(&crop).map(|outcome| (crop, outcome))
                })
                .await
                .unwrap_or_else(|e| {
                    Err(PipelineError::inference(format!("classification task failed: {e}")))
                });
                (index, classified)
            });
        }

        let mut joined = Vec::with_capacity(regions.len());
        while let Some(next) = tasks.join_next().await {
            let (index, classified) = next.map_err(|e| {
                PipelineError::inference(format!("classification task failed: {e}"))
            })?;
            joined.push((index, classified));
        }
        joined.sort_by_key(|(index, _)| *index);
        Ok(joined.into_iter().map(|(_, classified)| classified).collect())
    }

    /// Store the crop, then its record. A record never exists without its image.
    async fn persist_region(
        &self,
        ctx: &RunContext<'_>,
        index: usize,
        region: &DetectedRegion,
        crop: &DynamicImage,
        outcome: ClassificationOutcome,
    ) -> Result<RegionResult, PipelineError> {
        let run_id = ctx.run_id;
        let bytes = encode_jpeg(crop)?;
        let image_ref = self
            .store
            .save_image(ArtifactKind::Region, &bytes, &region_artifact_name(ctx.stem, &run_id, index))
            .await?;
        let record_id = self
            .store
            .create_record(&NewRecord {
                run_id,
                patient: ctx.patient,
                image_ref: image_ref.clone(),
                label: outcome.label,
                confidence: outcome.confidence,
            })
            .await?;
        debug!(
            "Run {}: region {} -> {} ({:.3}), record {}",
            run_id,
            index + 1,
            outcome.label,
            outcome.confidence,
            record_id
        );

        Ok(RegionResult {
            index,
            record_id,
            image_ref,
            label: outcome.label,
            confidence: outcome.confidence,
            bbox: region.bbox,
            detection_confidence: region.confidence,
        })
    }

    async fn persist_overview(
        &self,
        ctx: &RunContext<'_>,
        overview: &DynamicImage,
    ) -> Result<String, PipelineError> {
        let bytes = encode_jpeg(overview)?;
        let overview_ref = self
            .store
            .save_image(ArtifactKind::Overview, &bytes, &overview_artifact_name(ctx.stem, &ctx.run_id))
            .await?;
        self.store.attach_overview(ctx.run_id, &overview_ref).await?;
        Ok(overview_ref)
    }
}

/// Record a terminal failure on the trace before handing the error back.
fn fail_on<T>(trace: &mut RunTrace, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
    if let Err(err) = &result {
        trace.advance(PipelineState::Failed(err.kind()));
    }
    result
}
