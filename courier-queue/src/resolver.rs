//! Refreshing a job's recipient from the entity it references.
//!
//! Jobs addressed to a trainer, user or delegate carry a weak reference to
//! that entity. Just before sending (and before an operator retry) the
//! reference is looked up in a [`ContactDirectory`] so mail follows address
//! changes made after the job was queued.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use courier_common::tracing;
use serde::{Deserialize, Serialize};

use crate::{
    error::ResolverError,
    job::{EmailJob, RecipientRef, is_plausible_address},
    queue::JobQueue,
};

/// Current contact details for a referenced entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Contact {
    pub fn new(email: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            email: email.into(),
            name: name.map(str::to_string),
        }
    }
}

/// The lookup service that owns entity contact data.
///
/// Implementations sit behind their own authorisation boundary; the queue only
/// ever asks for the current address of a single reference.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// `Ok(None)` when the entity no longer exists.
    async fn lookup(&self, reference: &RecipientRef) -> Result<Option<Contact>, ResolverError>;
}

/// A directory held in memory, filled from configuration or by tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    contacts: Arc<RwLock<HashMap<RecipientRef, Contact>>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: RecipientRef, contact: Contact) {
        self.contacts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference, contact);
    }
}

impl FromIterator<(RecipientRef, Contact)> for MemoryDirectory {
    fn from_iter<T: IntoIterator<Item = (RecipientRef, Contact)>>(iter: T) -> Self {
        Self {
            contacts: Arc::new(RwLock::new(iter.into_iter().collect())),
        }
    }
}

#[async_trait]
impl ContactDirectory for MemoryDirectory {
    async fn lookup(&self, reference: &RecipientRef) -> Result<Option<Contact>, ResolverError> {
        Ok(self
            .contacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .cloned())
    }
}

/// Outcome of a resolve: the address to send to and whether it differs from
/// what the job had.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub changed: bool,
    pub email: String,
    pub name: Option<String>,
}

impl Resolution {
    fn unchanged(job: &EmailJob) -> Self {
        Self {
            changed: false,
            email: job.recipient_email.clone(),
            name: job.recipient_name.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RecipientResolver {
    directory: Arc<dyn ContactDirectory>,
}

impl std::fmt::Debug for RecipientResolver {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("RecipientResolver").finish_non_exhaustive()
    }
}

impl RecipientResolver {
    pub fn new(directory: Arc<dyn ContactDirectory>) -> Self {
        Self { directory }
    }

    /// A resolver whose directory knows nobody; every reference is stale.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Arc::new(MemoryDirectory::new()))
    }

    /// Looks up the job's reference without touching the job.
    ///
    /// No reference resolves to the job's own address. A missing entity is a
    /// [`ResolverError::NotFound`] and an address that could not go on the
    /// envelope is a [`ResolverError::InvalidContact`]; callers keep the stale
    /// address in both cases.
    pub async fn resolve(&self, job: &EmailJob) -> Result<Resolution, ResolverError> {
        let Some(reference) = &job.recipient_ref else {
            return Ok(Resolution::unchanged(job));
        };

        let contact = self
            .directory
            .lookup(reference)
            .await?
            .ok_or_else(|| ResolverError::NotFound(reference.clone()))?;

        // The address ends up in the SMTP envelope verbatim.
        if !is_plausible_address(&contact.email) {
            return Err(ResolverError::InvalidContact {
                reference: reference.clone(),
                email: contact.email,
            });
        }

        if contact.email == job.recipient_email {
            return Ok(Resolution::unchanged(job));
        }

        Ok(Resolution {
            changed: true,
            email: contact.email,
            name: contact.name,
        })
    }

    /// Resolves `job` and, if the address moved, records the change in the
    /// queue. Returns the job as it should be sent. Resolution failures are
    /// logged and the job is returned as it was.
    pub async fn refresh(&self, queue: &JobQueue, job: EmailJob) -> EmailJob {
        match self.resolve(&job).await {
            Ok(resolution) if resolution.changed => {
                tracing::info!(
                    id = %job.id,
                    from = %job.recipient_email,
                    to = %resolution.email,
                    "Recipient address changed"
                );
                queue
                    .update_recipient(&job.id, &resolution.email, resolution.name.as_deref())
                    .await
                    .unwrap_or(job)
            }
            Ok(_) => job,
            Err(e) => {
                tracing::warn!(id = %job.id, error = %e, "Keeping existing recipient address");
                job
            }
        }
    }
}
