mod state;

use std::{path::PathBuf, sync::Arc};

use image::DynamicImage;
use sqlx::{Row, sqlite::SqliteRow};
use state::{StoreState, sanitize_file_name};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::debug;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::core::store::{
    ArtifactKind, ArtifactStore, ClassificationRecord, NewRecord, NewRun, RecordRepository,
    RunRecord, StoreError,
};
use crate::models::{CellType, PatientRef, RunId};

/// SQLite records plus crop/overview files on the local filesystem.
#[derive(Debug, Clone)]
pub struct ArtifactDb {
    state: Arc<StoreState>,
}

impl ArtifactDb {
    /// Open (or create) the store, making sure every storage root exists.
    pub async fn new(config: &StorageConfig) -> Result<Self, StoreError> {
        Ok(Self {
            state: Arc::new(StoreState::new(config).await?),
        })
    }

    /// Filesystem path behind a storage reference.
    pub fn resolve(&self, image_ref: &str) -> PathBuf {
        self.state.resolve(image_ref)
    }

    /// Decode a stored artifact back into pixels.
    pub fn load_image(&self, image_ref: &str) -> Result<DynamicImage, StoreError> {
        self.state.load_image(image_ref)
    }
}

fn now_rfc3339() -> Result<String, StoreError> {
    Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
}

fn parse_run_id(value: &str) -> Result<RunId, StoreError> {
    Uuid::parse_str(value)
        .map(RunId)
        .map_err(|e| StoreError::Corrupt(format!("run id '{value}': {e}")))
}

fn record_from_row(row: &SqliteRow) -> Result<ClassificationRecord, StoreError> {
    let label: String = row.try_get("label")?;
    let label = CellType::from_name(&label)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown cell type '{label}'")))?;
    let run_id: String = row.try_get("run_id")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(ClassificationRecord {
        id: row.try_get("id")?,
        run_id: parse_run_id(&run_id)?,
        patient: PatientRef(row.try_get("patient_ref")?),
        source_region_image: row.try_get("source_region_image")?,
        overview_image: row.try_get("overview_image")?,
        label,
        confidence: row.try_get::<f64, _>("confidence")? as f32,
        created_at: OffsetDateTime::parse(&created_at, &Rfc3339)?,
    })
}

const RECORD_COLUMNS: &str = "id, run_id, patient_ref, source_region_image, overview_image, label, confidence, created_at";

impl ArtifactStore for ArtifactDb {
    async fn save_image(
        &self,
        kind: ArtifactKind,
        bytes: &[u8],
        suggested_name: &str,
    ) -> Result<String, StoreError> {
        let file_name = sanitize_file_name(suggested_name);
        let image_ref = self.state.write_image(kind, &file_name, bytes).await?;
        debug!("Stored {:?} artifact {} ({} bytes)", kind, image_ref, bytes.len());
        Ok(image_ref)
    }

    async fn create_run(&self, run: &NewRun) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pipeline_run (id, patient_ref, source_name, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(run.id.to_string())
        .bind(run.patient.0)
        .bind(&run.source_name)
        .bind(now_rfc3339()?)
        .execute(&self.state.pool)
        .await?;
        Ok(())
    }

    async fn create_record(&self, record: &NewRecord) -> Result<i64, StoreError> {
        let id = sqlx::query(
            r#"INSERT INTO classification_record
                (run_id, patient_ref, source_region_image, label, confidence, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(record.run_id.to_string())
        .bind(record.patient.0)
        .bind(&record.image_ref)
        .bind(record.label.name())
        .bind(record.confidence as f64)
        .bind(now_rfc3339()?)
        .execute(&self.state.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    async fn attach_overview(&self, run_id: RunId, overview_ref: &str) -> Result<(), StoreError> {
        let mut tx = self.state.pool.begin().await?;

        let updated = sqlx::query("UPDATE pipeline_run SET overview_image = $1 WHERE id = $2")
            .bind(overview_ref)
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::RunNotFound(run_id));
        }

        sqlx::query(
            r#"UPDATE classification_record SET overview_image = $1
            WHERE id = (SELECT MIN(id) FROM classification_record WHERE run_id = $2)"#,
        )
        .bind(overview_ref)
        .bind(run_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

impl RecordRepository for ArtifactDb {
    async fn record(&self, id: i64) -> Result<ClassificationRecord, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM classification_record WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.state.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;
        record_from_row(&row)
    }

    async fn records_for_patient(
        &self,
        patient: PatientRef,
    ) -> Result<Vec<ClassificationRecord>, StoreError> {
        sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM classification_record WHERE patient_ref = $1 ORDER BY id ASC"
        ))
        .bind(patient.0)
        .fetch_all(&self.state.pool)
        .await?
        .iter()
        .map(record_from_row)
        .collect()
    }

    async fn records_for_run(&self, run_id: RunId) -> Result<Vec<ClassificationRecord>, StoreError> {
        sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM classification_record WHERE run_id = $1 ORDER BY id ASC"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.state.pool)
        .await?
        .iter()
        .map(record_from_row)
        .collect()
    }

    async fn run(&self, run_id: RunId) -> Result<RunRecord, StoreError> {
        let row = sqlx::query(
            "SELECT id, patient_ref, source_name, overview_image, created_at FROM pipeline_run WHERE id = $1",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.state.pool)
        .await?
        .ok_or(StoreError::RunNotFound(run_id))?;

        let id: String = row.try_get("id")?;
        let created_at: String = row.try_get("created_at")?;
        Ok(RunRecord {
            id: parse_run_id(&id)?,
            patient: PatientRef(row.try_get("patient_ref")?),
            source_name: row.try_get("source_name")?,
            overview_image: row.try_get("overview_image")?,
            created_at: OffsetDateTime::parse(&created_at, &Rfc3339)?,
        })
    }
}
