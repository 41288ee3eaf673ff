//! Durable layers under the job queue.
//!
//! The queue keeps every job in memory and writes each mutated job through to
//! a [`BackingStore`]; on startup the store's contents become the queue.

mod file;
mod memory;

use std::{fmt::Debug, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use file::FileBackingStore;
pub use memory::MemoryBackingStore;

use crate::{error::StoreError, job::EmailJob};

#[async_trait]
pub trait BackingStore: Send + Sync + Debug {
    /// Persists the latest copy of `job`, replacing any previous one.
    async fn save(&self, job: &EmailJob) -> Result<(), StoreError>;

    /// Every persisted job, oldest first.
    async fn load_all(&self) -> Result<Vec<EmailJob>, StoreError>;
}

/// Which backing store the daemon runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreConfig {
    /// Nothing survives a restart
    #[default]
    Memory,
    /// One file per job under `path`
    File { path: PathBuf },
}

impl StoreConfig {
    /// Builds the store, creating the directory for a file store.
    pub fn build(&self) -> Result<Arc<dyn BackingStore>, StoreError> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryBackingStore::new())),
            Self::File { path } => {
                let mut store = FileBackingStore::new(path.clone())?;
                store.init()?;
                Ok(Arc::new(store))
            }
        }
    }
}
