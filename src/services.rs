//! Load-once inference services shared by every pipeline run in the process.

use std::sync::{Arc, Mutex, OnceLock};

use tracing::info;

use crate::classification::{MobileNetClassifier, RegionClassifier};
use crate::config::ModelConfig;
use crate::detection::{RegionDetector, YoloDetector};
use crate::error::PipelineError;

static SERVICES: OnceLock<InferenceServices> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Read-only detector and classifier handles.
#[derive(Clone)]
pub struct InferenceServices {
    pub detector: Arc<dyn RegionDetector>,
    pub classifier: Arc<dyn RegionClassifier>,
}

impl InferenceServices {
    pub fn new(detector: Arc<dyn RegionDetector>, classifier: Arc<dyn RegionClassifier>) -> Self {
        Self {
            detector,
            classifier,
        }
    }

    /// Load both models from disk.
    pub fn load(config: &ModelConfig) -> Result<Self, PipelineError> {
        info!("Loading detector from {}", config.detector_path.display());
        let detector = YoloDetector::load(config)?;
        info!("Loading classifier from {}", config.classifier_path.display());
        let classifier = MobileNetClassifier::load(config)?;
        Ok(Self::new(Arc::new(detector), Arc::new(classifier)))
    }

    /// Initialise the process-wide services at startup.
    ///
    /// Models are loaded at most once; later calls return the loaded handles
    /// and ignore `config`.
    pub fn init_global(config: &ModelConfig) -> Result<&'static InferenceServices, PipelineError> {
        if let Some(services) = SERVICES.get() {
            return Ok(services);
        }
        let _guard = INIT_LOCK
            .lock()
            .map_err(|_| PipelineError::model_unavailable("model initialisation lock poisoned"))?;
        if let Some(services) = SERVICES.get() {
            return Ok(services);
        }
        let services = Self::load(config)?;
        Ok(SERVICES.get_or_init(|| services))
    }

    /// Services set up by [`InferenceServices::init_global`], if any.
    pub fn global() -> Option<&'static InferenceServices> {
        SERVICES.get()
    }
}
