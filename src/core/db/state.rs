use std::path::{Path, PathBuf};

use image::DynamicImage;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use tokio::{fs as async_fs, io::AsyncWriteExt};

use crate::config::StorageConfig;
use crate::core::store::{ArtifactKind, StoreError};

const ROI_REF_PREFIX: &str = "roi";
const ANNOTATED_REF_PREFIX: &str = "annotated";

pub(super) struct StoreState {
    data_dir: PathBuf,
    roi_dir: PathBuf,
    annotated_dir: PathBuf,
    pub(super) pool: SqlitePool,
}

impl std::fmt::Debug for StoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreState")
            .field("roi_dir", &self.roi_dir)
            .field("annotated_dir", &self.annotated_dir)
            .finish()
    }
}

impl StoreState {
    pub(super) async fn new(config: &StorageConfig) -> Result<Self, StoreError> {
        let roi_dir = config.roi_dir();
        let annotated_dir = config.annotated_dir();
        async_fs::create_dir_all(&roi_dir).await?;
        async_fs::create_dir_all(&annotated_dir).await?;

        let connect_opts = SqliteConnectOptions::new()
            .filename(config.db_file())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_opts)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            data_dir: config.data_dir.clone(),
            roi_dir,
            annotated_dir,
            pool,
        })
    }

    fn dir_for(&self, kind: ArtifactKind) -> (&Path, &'static str) {
        match kind {
            ArtifactKind::Region => (&self.roi_dir, ROI_REF_PREFIX),
            ArtifactKind::Overview => (&self.annotated_dir, ANNOTATED_REF_PREFIX),
        }
    }

    /// Write an artifact under its family directory, returning `"<family>/<file>"`.
    /// Fails rather than replacing an existing file.
    pub(super) async fn write_image(
        &self,
        kind: ArtifactKind,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<String, StoreError> {
        let (dir, prefix) = self.dir_for(kind);
        let dest_path = dir.join(file_name);

        let mut file = async_fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        Ok(format!("{prefix}/{file_name}"))
    }

    pub(super) fn resolve(&self, image_ref: &str) -> PathBuf {
        self.data_dir.join(image_ref)
    }

    pub(super) fn load_image(&self, image_ref: &str) -> Result<DynamicImage, StoreError> {
        Ok(image::open(self.resolve(image_ref))?)
    }
}

/// Keep only characters that are safe in a file name.
pub(super) fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() { "artifact".to_string() } else { cleaned }
}
