use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;

use super::BackingStore;
use crate::{
    error::StoreError,
    job::{EmailJob, JobId},
};

/// In-memory backing store
///
/// Holds the last saved copy of each job in a `HashMap` behind an `RwLock`.
/// Meant for tests and development; nothing survives the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackingStore {
    jobs: Arc<RwLock<HashMap<JobId, EmailJob>>>,
}

impl MemoryBackingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The last saved copy of a job, as a restart would see it.
    #[must_use]
    pub fn get(&self, id: &JobId) -> Option<EmailJob> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn save(&self, job: &EmailJob) -> Result<(), StoreError> {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id, job.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<EmailJob>, StoreError> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }
}
