//! One dispatch cycle: claim, resolve, send, record.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use courier_common::tracing::{self, debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::{self, JoinSet};

use super::Dispatcher;
use crate::job::{EmailJob, JobId, JobStatus};

/// What happened to a single claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    /// Failed and rescheduled
    Retried,
    /// Failed for the last time
    Failed,
    /// Cancelled (or otherwise released) between claim and send
    Skipped,
}

/// Totals for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchReport {
    const fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

impl Dispatcher {
    /// Claims up to `batch_size` jobs due at `now` and sends them, at most
    /// `max_concurrent_sends` at a time.
    ///
    /// Never fails: every outcome is recorded on its job.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn process_batch(self: &Arc<Self>, now: DateTime<Utc>) -> BatchReport {
        let claimed = self
            .queue
            .claim_due_batch(self.config.batch_size, now)
            .await;

        let mut report = BatchReport {
            claimed: claimed.len(),
            ..BatchReport::default()
        };
        if claimed.is_empty() {
            return report;
        }

        info!(
            claimed = claimed.len(),
            max_concurrent = self.config.max_concurrent_sends,
            "Dispatching claimed jobs"
        );

        let mut join_set: JoinSet<Outcome> = JoinSet::new();
        let mut tasks: HashMap<task::Id, JobId> = HashMap::new();
        let mut remaining = claimed.into_iter();

        for job in remaining
            .by_ref()
            .take(self.config.max_concurrent_sends.max(1))
        {
            self.spawn_job(&mut join_set, &mut tasks, job);
        }

        while let Some(result) = join_set.join_next_with_id().await {
            let outcome = match result {
                Ok((task, outcome)) => {
                    tasks.remove(&task);
                    outcome
                }
                Err(e) => {
                    error!(error = %e, "Send task aborted");
                    match tasks.remove(&e.id()) {
                        Some(id) => self.recover_aborted(&id, &e.to_string()).await,
                        None => Outcome::Skipped,
                    }
                }
            };
            report.record(outcome);

            if let Some(job) = remaining.next() {
                self.spawn_job(&mut join_set, &mut tasks, job);
            }
        }

        report
    }

    fn spawn_job(
        self: &Arc<Self>,
        join_set: &mut JoinSet<Outcome>,
        tasks: &mut HashMap<task::Id, JobId>,
        job: EmailJob,
    ) {
        let id = job.id;
        let handle = join_set.spawn(Arc::clone(self).process_job(job));
        tasks.insert(handle.id(), id);
    }

    /// A send task died without recording an outcome. The job is still
    /// claimed, so it goes through the normal failure path.
    async fn recover_aborted(&self, id: &JobId, reason: &str) -> Outcome {
        match self.queue.get(id) {
            Ok(job) if job.status == JobStatus::Sending => {
                self.record_failure(&job, &format!("send task aborted: {reason}"))
                    .await
            }
            _ => Outcome::Skipped,
        }
    }

    async fn process_job(self: Arc<Self>, job: EmailJob) -> Outcome {
        let id = job.id;
        let job = self.resolver.refresh(&self.queue, job).await;

        // A cancel may have landed while the recipient was being resolved.
        let job = match self.queue.get(&id) {
            Ok(current) if current.status == JobStatus::Sending => current,
            Ok(current) => {
                debug!(%id, status = %current.status, "Job released before send, skipping");
                return Outcome::Skipped;
            }
            Err(_) => {
                warn!(%id, to = %job.recipient_email, "Claimed job disappeared, skipping");
                return Outcome::Skipped;
            }
        };

        let email = job.to_email();
        let result =
            match tokio::time::timeout(self.config.send_timeout(), self.transport.send(&email))
                .await
            {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!(
                    "send timed out after {}s",
                    self.config.send_timeout_secs
                )),
            };

        match result {
            Ok(()) => {
                if self.queue.mark_sent(&id, Utc::now()).await {
                    info!(%id, to = %job.recipient_email, "Email sent");
                    Outcome::Sent
                } else {
                    Outcome::Skipped
                }
            }
            Err(message) => self.record_failure(&job, &message).await,
        }
    }

    async fn record_failure(&self, job: &EmailJob, message: &str) -> Outcome {
        let attempts = job.attempts.saturating_add(1);

        if attempts < job.max_attempts {
            let next = self.config.retry.next_attempt_at(attempts, Utc::now());
            if self.queue.mark_retry(&job.id, next, message).await {
                warn!(
                    id = %job.id,
                    attempt = attempts,
                    max_attempts = job.max_attempts,
                    next_attempt = %next,
                    error = message,
                    "Send failed, will retry"
                );
                return Outcome::Retried;
            }
        } else if self.queue.mark_failed(&job.id, message).await {
            error!(
                id = %job.id,
                attempts,
                error = message,
                "Send failed, giving up"
            );
            return Outcome::Failed;
        }

        Outcome::Skipped
    }
}
