//! Operator actions on existing jobs.
//!
//! Ineligible jobs are reported as `false` rather than errors; only unknown
//! ids and invalid forward addresses fail.

use chrono::Utc;
use courier_common::{internal, tracing};

use crate::{
    error::QueueError,
    job::{EmailJob, JobId, NewJob},
    queue::JobQueue,
    resolver::RecipientResolver,
};

#[derive(Debug, Clone)]
pub struct QueueOperations {
    queue: JobQueue,
    resolver: RecipientResolver,
}

impl QueueOperations {
    pub const fn new(queue: JobQueue, resolver: RecipientResolver) -> Self {
        Self { queue, resolver }
    }

    pub const fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Queues a sent, failed or cancelled job again with a fresh attempt
    /// budget, refreshing its recipient first.
    ///
    /// `Ok(false)` if the job is pending or currently being sent.
    #[tracing::instrument(skip(self))]
    pub async fn retry(&self, id: &JobId) -> Result<bool, QueueError> {
        let job = self.queue.get(id)?;
        if !job.status.is_requeueable() {
            tracing::debug!(%id, status = %job.status, "Job not eligible for retry");
            return Ok(false);
        }

        self.resolver.refresh(&self.queue, job).await;

        let requeued = self.queue.requeue(id, Utc::now()).await;
        if requeued {
            internal!(level = INFO, "Job {id} queued for retry");
        }
        Ok(requeued)
    }

    /// [`Self::retry`] for each id independently. Returns how many were
    /// queued; unknown ids count as not queued.
    pub async fn bulk_retry(&self, ids: &[JobId]) -> usize {
        let mut count = 0;
        for id in ids {
            match self.retry(id).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(%id, error = %e, "Bulk retry skipped job"),
            }
        }
        count
    }

    /// Copies a job's content into a new pending job for a different
    /// recipient. The source job is not touched.
    #[tracing::instrument(skip(self, new_name))]
    pub async fn forward(
        &self,
        id: &JobId,
        new_email: &str,
        new_name: Option<&str>,
    ) -> Result<JobId, QueueError> {
        let source = self.queue.get(id)?;

        let new = forwarded(&source, new_email, new_name);
        new.validate()?;

        let mut job = EmailJob::new(new, Utc::now());
        job.forwarded_from = Some(source.id);
        let new_id = self.queue.insert(job).await?;

        internal!(level = INFO, "Job {id} forwarded to {new_email} as {new_id}");
        Ok(new_id)
    }

    /// Cancels a pending or claimed job. `Ok(false)` once it has finished.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: &JobId) -> Result<bool, QueueError> {
        self.queue.get(id)?;

        let cancelled = self.queue.mark_cancelled(id).await;
        if cancelled {
            internal!(level = INFO, "Job {id} cancelled");
        }
        Ok(cancelled)
    }
}

/// The source's content addressed to someone else. The weak reference stays
/// behind: the new recipient is not that entity.
fn forwarded(source: &EmailJob, email: &str, name: Option<&str>) -> NewJob {
    NewJob {
        recipient_email: email.to_string(),
        recipient_name: name.map(str::to_string),
        subject: source.subject.clone(),
        html_body: source.html_body.clone(),
        text_body: source.text_body.clone(),
        template_key: source.template_key.clone(),
        template_data: source.template_data.clone(),
        attachments: source.attachments.clone(),
        priority: source.priority,
        max_attempts: source.max_attempts,
        scheduled_at: None,
        recipient_ref: None,
    }
}
