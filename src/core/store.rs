//! Outbound interface to wherever crops, overviews and result records are kept.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::models::{CellType, PatientRef, RunId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("timestamp formatting failed: {0}")]
    TimeFormat(#[from] time::error::Format),

    #[error("timestamp parsing failed: {0}")]
    TimeParse(#[from] time::error::Parse),

    #[error("record {0} not found")]
    NotFound(i64),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

/// Which artifact family an image belongs to; decides where it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Region,
    Overview,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: RunId,
    pub patient: PatientRef,
    pub source_name: String,
}

#[derive(Debug, Clone)]
pub struct NewRecord {
    pub run_id: RunId,
    pub patient: PatientRef,
    pub image_ref: String,
    pub label: CellType,
    pub confidence: f32,
}

/// Persisted outcome for one classified region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub id: i64,
    pub run_id: RunId,
    pub patient: PatientRef,
    pub source_region_image: String,
    /// Set on the first record of a run only.
    pub overview_image: Option<String>,
    pub label: CellType,
    pub confidence: f32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub patient: PatientRef,
    pub source_name: String,
    pub overview_image: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Write side used by the pipeline.
pub trait ArtifactStore {
    /// Persist encoded image bytes, returning a storage reference.
    /// Never overwrites an existing artifact.
    fn save_image(
        &self,
        kind: ArtifactKind,
        bytes: &[u8],
        suggested_name: &str,
    ) -> impl Future<Output = Result<String, StoreError>>;

    fn create_run(&self, run: &NewRun) -> impl Future<Output = Result<(), StoreError>>;

    /// Create a record for an already persisted region image. Returns the record id.
    fn create_record(&self, record: &NewRecord) -> impl Future<Output = Result<i64, StoreError>>;

    /// Reference the overview from the run and from the run's first record.
    fn attach_overview(
        &self,
        run_id: RunId,
        overview_ref: &str,
    ) -> impl Future<Output = Result<(), StoreError>>;
}

/// Read side used by callers browsing results.
pub trait RecordRepository {
    fn record(&self, id: i64) -> impl Future<Output = Result<ClassificationRecord, StoreError>>;
    fn records_for_patient(
        &self,
        patient: PatientRef,
    ) -> impl Future<Output = Result<Vec<ClassificationRecord>, StoreError>>;
    fn records_for_run(
        &self,
        run_id: RunId,
    ) -> impl Future<Output = Result<Vec<ClassificationRecord>, StoreError>>;
    fn run(&self, run_id: RunId) -> impl Future<Output = Result<RunRecord, StoreError>>;
}
