use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use courier_common::{internal, tracing};
use serde::Deserialize;
use tokio::fs;

use super::BackingStore;
use crate::{
    error::StoreError,
    job::{EmailJob, JobId},
};

/// Directories a store must never be pointed at.
const SENSITIVE_PREFIXES: [&str; 9] = [
    "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
];

/// File-based backing store
///
/// Each job lives in `{id}.bin` (bincode) inside a single directory. Saves
/// write `.tmp_{id}.{nonce}` first and then rename over the final name, so a
/// crash mid-write leaves either the old copy or the new one, never a torn
/// file. Temporary files are ignored when loading and removed by
/// [`FileBackingStore::init`].
#[derive(Debug, Clone)]
pub struct FileBackingStore {
    path: PathBuf,
}

impl<'de> Deserialize<'de> for FileBackingStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileBackingStoreHelper {
            path: PathBuf,
        }

        let helper = FileBackingStoreHelper::deserialize(deserializer)?;
        Self::new(helper.path).map_err(serde::de::Error::custom)
    }
}

impl FileBackingStore {
    /// Validates `path` without touching the filesystem; see [`Self::init`].
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        Self::validate_path(&path)?;
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rejects relative paths, `..` components and system directories.
    fn validate_path(path: &Path) -> Result<(), StoreError> {
        let invalid = |reason: &str| StoreError::InvalidPath {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if path.components().any(|c| c == Component::ParentDir) {
            return Err(invalid("must not contain '..' components"));
        }

        if !path.is_absolute() {
            return Err(invalid("must be absolute"));
        }

        if let Some(prefix) = SENSITIVE_PREFIXES
            .iter()
            .find(|prefix| path.starts_with(prefix))
        {
            return Err(invalid(&format!("must not be inside {prefix}")));
        }

        Ok(())
    }

    /// Creates the directory if needed and clears temporary files left by a
    /// crash.
    pub fn init(&mut self) -> Result<(), StoreError> {
        internal!("Initialising file store at {}", self.path.display());

        if !self.path.try_exists()? {
            internal!("{} does not exist, creating...", self.path.display());
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(StoreError::InvalidPath {
                path: self.path.clone(),
                reason: "is not a directory".to_string(),
            });
        }

        let mut cleaned = 0;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(".tmp_") {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Removed {cleaned} incomplete writes from {}",
                self.path.display()
            );
        }

        Ok(())
    }

    fn job_path(&self, id: &JobId) -> PathBuf {
        self.path.join(format!("{id}.bin"))
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    #[tracing::instrument(level = "debug", skip(self, job), fields(id = %job.id))]
    async fn save(&self, job: &EmailJob) -> Result<(), StoreError> {
        let encoded = bincode::serde::encode_to_vec(job, bincode::config::legacy())?;

        let final_path = self.job_path(&job.id);
        let temp_path = self
            .path
            .join(format!(".tmp_{}.{}", job.id, ulid::Ulid::new()));

        fs::write(&temp_path, &encoded).await?;
        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        internal!(level = DEBUG, "Persisted job {} ({})", job.id, job.status);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn load_all(&self) -> Result<Vec<EmailJob>, StoreError> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut jobs = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.starts_with(".tmp_") {
                continue;
            }
            let Some(id) = JobId::from_filename(&filename) else {
                continue;
            };

            let bytes = fs::read(entry.path()).await?;
            match bincode::serde::decode_from_slice::<EmailJob, _>(
                &bytes,
                bincode::config::legacy(),
            ) {
                Ok((job, _)) if job.id == id => jobs.push(job),
                Ok((job, _)) => tracing::warn!(
                    file = %filename,
                    contains = %job.id,
                    "Skipping job file whose name does not match its contents"
                ),
                Err(e) => tracing::warn!(file = %filename, error = %e, "Skipping unreadable job file"),
            }
        }

        jobs.sort_by_key(|job| job.id);
        internal!(level = DEBUG, "Loaded {} jobs from {}", jobs.len(), self.path.display());

        Ok(jobs)
    }
}
