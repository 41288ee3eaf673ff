//! The job queue: the authoritative set of jobs and every state transition.
//!
//! Jobs live in a `DashMap`; each transition locks only the job's shard entry,
//! checks the status it expects, mutates, and then writes the job through to
//! the backing store. A transition whose expected status doesn't match is a
//! `false` outcome rather than an error, so racing operators and dispatchers
//! resolve to exactly one winner.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_common::{internal, tracing};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    error::{QueueError, StoreError},
    job::{EmailJob, JobId, JobStats, JobStatus, NewJob},
    store::{BackingStore, MemoryBackingStore},
};

#[derive(Debug, Clone)]
pub struct JobQueue {
    jobs: Arc<DashMap<JobId, EmailJob>>,
    store: Arc<dyn BackingStore>,
    /// Serialises write-through so the last write of a job carries its newest
    /// state.
    persist_lock: Arc<Mutex<()>>,
}

impl JobQueue {
    /// An empty queue over `store`. Use [`Self::restore`] to load existing jobs.
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            store,
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    /// An empty queue over a [`MemoryBackingStore`].
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackingStore::new()))
    }

    /// Loads every job from `store`.
    ///
    /// Jobs found in `sending` were claimed by a process that never finished
    /// the attempt; they go back to `pending` so they are tried again.
    pub async fn restore(store: Arc<dyn BackingStore>) -> Result<Self, StoreError> {
        let queue = Self::new(store);
        let now = Utc::now();
        let mut reclaimed = Vec::new();

        for mut job in queue.store.load_all().await? {
            if job.status == JobStatus::Sending {
                job.status = JobStatus::Pending;
                job.claimed_at = None;
                job.updated_at = now;
                reclaimed.push(job.id);
            }
            queue.jobs.insert(job.id, job);
        }

        for id in &reclaimed {
            queue.persist(id).await;
        }

        internal!(
            level = INFO,
            "Restored {} jobs ({} interrupted sends returned to pending)",
            queue.jobs.len(),
            reclaimed.len()
        );

        Ok(queue)
    }

    /// Validates and stores a new pending job.
    #[tracing::instrument(skip(self, new), fields(to = %new.recipient_email))]
    pub async fn enqueue(&self, new: NewJob) -> Result<JobId, QueueError> {
        new.validate()?;
        let job = EmailJob::new(new, Utc::now());
        self.insert(job).await
    }

    /// Stores an already-built job; the store write must succeed for the job
    /// to become visible.
    pub(crate) async fn insert(&self, job: EmailJob) -> Result<JobId, QueueError> {
        let id = job.id;

        {
            let _guard = self.persist_lock.lock().await;
            self.store.save(&job).await?;
            self.jobs.insert(id, job);
        }

        internal!(level = DEBUG, "Enqueued job {id}");
        Ok(id)
    }

    /// Atomically claims up to `limit` due jobs, highest priority first and
    /// then oldest `scheduled_at`, moving each to `sending`.
    ///
    /// The status is re-checked under the entry lock, so a job seen as due by
    /// several concurrent claimers is handed to exactly one of them.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn claim_due_batch(&self, limit: usize, now: DateTime<Utc>) -> Vec<EmailJob> {
        if limit == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(JobId, i32, DateTime<Utc>)> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().is_due(now))
            .map(|entry| {
                let job = entry.value();
                (job.id, job.priority, job.scheduled_at)
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut claimed = Vec::new();
        for (id, _, _) in candidates {
            if claimed.len() >= limit {
                break;
            }

            let Some(mut entry) = self.jobs.get_mut(&id) else {
                continue;
            };
            let job = entry.value_mut();
            if job.is_due(now) {
                job.status = JobStatus::Sending;
                job.claimed_at = Some(now);
                job.updated_at = Utc::now();
                claimed.push(job.clone());
            }
        }

        for job in &claimed {
            self.persist(&job.id).await;
        }

        if !claimed.is_empty() {
            internal!(level = DEBUG, "Claimed {} jobs", claimed.len());
        }

        claimed
    }

    /// A claimed job was accepted by the server.
    pub async fn mark_sent(&self, id: &JobId, sent_at: DateTime<Utc>) -> bool {
        self.transition(id, &[JobStatus::Sending], |job| {
            job.status = JobStatus::Sent;
            job.attempts = job.attempts.saturating_add(1).min(job.max_attempts);
            job.sent_at = Some(sent_at);
            job.error_message = None;
            job.claimed_at = None;
        })
        .await
        .is_some()
    }

    /// A claimed job failed and should be tried again at `next_scheduled_at`.
    ///
    /// Records the attempt. If that exhausts `max_attempts` the job fails
    /// instead, so the attempt bound holds whatever the caller computed.
    pub async fn mark_retry(
        &self,
        id: &JobId,
        next_scheduled_at: DateTime<Utc>,
        error_message: &str,
    ) -> bool {
        self.transition(id, &[JobStatus::Sending], |job| {
            job.attempts = job.attempts.saturating_add(1).min(job.max_attempts);
            job.error_message = Some(error_message.to_string());
            job.claimed_at = None;

            if job.attempts >= job.max_attempts {
                job.status = JobStatus::Failed;
            } else {
                job.status = JobStatus::Pending;
                job.scheduled_at = next_scheduled_at;
            }
        })
        .await
        .is_some()
    }

    /// A claimed job failed for the last time. Records the attempt.
    pub async fn mark_failed(&self, id: &JobId, error_message: &str) -> bool {
        self.transition(id, &[JobStatus::Sending], |job| {
            job.status = JobStatus::Failed;
            job.attempts = job.attempts.saturating_add(1).min(job.max_attempts);
            job.error_message = Some(error_message.to_string());
            job.claimed_at = None;
        })
        .await
        .is_some()
    }

    /// Cancels a pending or claimed job. A dispatcher holding the claim sees
    /// the change when it re-checks the status before sending.
    pub async fn mark_cancelled(&self, id: &JobId) -> bool {
        self.transition(id, &[JobStatus::Pending, JobStatus::Sending], |job| {
            job.status = JobStatus::Cancelled;
            job.claimed_at = None;
        })
        .await
        .is_some()
    }

    /// Puts a sent, failed or cancelled job back in the queue with a fresh
    /// attempt budget. Re-queuing a sent job counts as a resend.
    pub async fn requeue(&self, id: &JobId, now: DateTime<Utc>) -> bool {
        self.transition(
            id,
            &[JobStatus::Sent, JobStatus::Failed, JobStatus::Cancelled],
            |job| {
                if job.status == JobStatus::Sent {
                    job.original_sent_at = job.original_sent_at.or(job.sent_at);
                    job.resend_count = job.resend_count.saturating_add(1);
                }

                job.status = JobStatus::Pending;
                job.attempts = 0;
                job.error_message = None;
                job.sent_at = None;
                job.scheduled_at = now;
                job.claimed_at = None;
            },
        )
        .await
        .is_some()
    }

    /// Points a job at a new address, remembering the first address that was
    /// replaced. No-op if the address is unchanged.
    pub async fn update_recipient(
        &self,
        id: &JobId,
        email: &str,
        name: Option<&str>,
    ) -> Option<EmailJob> {
        self.transition(id, &JobStatus::ALL, |job| {
            if job.recipient_email != email {
                if job.original_recipient_email.is_none() {
                    job.original_recipient_email = Some(job.recipient_email.clone());
                }
                job.recipient_email = email.to_string();
                job.recipient_name = name.map(str::to_string);
            }
        })
        .await
    }

    pub fn get(&self, id: &JobId) -> Result<EmailJob, QueueError> {
        self.jobs
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(QueueError::NotFound(*id))
    }

    /// Jobs in creation order, optionally only those in `status`.
    pub fn list(&self, status: Option<JobStatus>) -> Vec<EmailJob> {
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .filter(|entry| status.is_none_or(|status| entry.value().status == status))
            .map(|entry| entry.value().clone())
            .collect();

        jobs.sort_by_key(|job| (job.created_at, job.id));
        jobs
    }

    pub fn stats(&self) -> JobStats {
        let mut stats = JobStats::default();
        for entry in self.jobs.iter() {
            stats.record(entry.value().status);
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Applies `apply` if the job is in one of `expected`, then persists it.
    async fn transition<F>(&self, id: &JobId, expected: &[JobStatus], apply: F) -> Option<EmailJob>
    where
        F: FnOnce(&mut EmailJob),
    {
        let updated = {
            let mut entry = self.jobs.get_mut(id)?;
            let job = entry.value_mut();
            if !expected.contains(&job.status) {
                tracing::debug!(%id, status = %job.status, "Transition skipped, status changed");
                return None;
            }

            let before = job.status;
            apply(job);
            job.updated_at = Utc::now();
            tracing::trace!(%id, from = %before, to = %job.status, "Job transition");
            job.clone()
        };

        self.persist(id).await;
        Some(updated)
    }

    /// Writes the current copy of a job to the backing store. Failures are
    /// logged; the in-memory state stays authoritative.
    async fn persist(&self, id: &JobId) {
        let _guard = self.persist_lock.lock().await;

        // Snapshot under the lock so a slower writer can't overwrite newer state.
        let Some(job) = self.jobs.get(id).map(|entry| entry.value().clone()) else {
            return;
        };

        if let Err(e) = self.store.save(&job).await {
            tracing::error!(%id, error = %e, "Failed to persist job");
        }
    }
}
