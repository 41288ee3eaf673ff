//! Dispatcher: claims due jobs and hands them to the transport.

mod process;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use courier_common::{Signal, internal, tracing};
use courier_smtp::Transport;
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, time::MissedTickBehavior};

pub use process::{BatchReport, Outcome};

use crate::{
    error::ConfigError, policy::RetryPolicy, queue::JobQueue, resolver::RecipientResolver,
};

/// Tunables for the dispatch loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// How often to look for due jobs (in seconds)
    ///
    /// Default: 5 seconds
    #[serde(default = "defaults::poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Most jobs claimed per cycle
    ///
    /// Default: 50
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Sends in flight at once within a cycle
    ///
    /// Default: 8
    #[serde(default = "defaults::max_concurrent_sends")]
    pub max_concurrent_sends: usize,

    /// Upper bound on a whole SMTP submission, on top of the transport's own
    /// per-step deadlines (in seconds)
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// How long shutdown waits for an in-flight cycle (in seconds). Sends
    /// still running after this are abandoned and retried after restart.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: defaults::poll_interval_secs(),
            batch_size: defaults::batch_size(),
            max_concurrent_sends: defaults::max_concurrent_sends(),
            send_timeout_secs: defaults::send_timeout_secs(),
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Checked once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Zero("poll_interval_secs"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch_size"));
        }
        if self.max_concurrent_sends == 0 {
            return Err(ConfigError::Zero("max_concurrent_sends"));
        }
        if self.send_timeout_secs == 0 {
            return Err(ConfigError::Zero("send_timeout_secs"));
        }

        self.retry.validate()
    }
}

mod defaults {
    pub const fn poll_interval_secs() -> u64 {
        5
    }

    pub const fn batch_size() -> usize {
        50
    }

    pub const fn max_concurrent_sends() -> usize {
        8
    }

    pub const fn send_timeout_secs() -> u64 {
        300
    }

    pub const fn shutdown_timeout_secs() -> u64 {
        30
    }
}

/// Drives jobs from `pending` to `sent` or `failed`.
///
/// Several dispatchers may share one [`JobQueue`]; claiming is atomic so each
/// job is attempted by exactly one of them per cycle.
pub struct Dispatcher {
    config: DispatcherConfig,
    queue: JobQueue,
    resolver: RecipientResolver,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        queue: JobQueue,
        resolver: RecipientResolver,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            queue,
            resolver,
            transport,
        }
    }

    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub const fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Runs dispatch cycles every `poll_interval` until a shutdown signal.
    ///
    /// A shutdown that arrives mid-cycle waits up to `shutdown_timeout` for
    /// the cycle's sends; jobs abandoned after that stay `sending` in the
    /// store and return to `pending` when the queue is next restored.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(
            "Dispatcher starting (poll every {}s, {} concurrent sends)",
            self.config.poll_interval_secs,
            self.config.max_concurrent_sends
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cycle = self.process_batch(Utc::now());
                    tokio::pin!(cycle);

                    tokio::select! {
                        report = &mut cycle => log_report(&report),
                        sig = shutdown.recv() => {
                            log_shutdown(&sig);
                            match tokio::time::timeout(self.config.shutdown_timeout(), cycle).await {
                                Ok(report) => {
                                    log_report(&report);
                                    internal!("In-flight sends completed");
                                }
                                Err(_) => tracing::warn!(
                                    timeout_secs = self.config.shutdown_timeout_secs,
                                    "Shutdown timeout exceeded, unfinished sends will be retried on restart"
                                ),
                            }
                            break;
                        }
                    }
                }
                sig = shutdown.recv() => {
                    log_shutdown(&sig);
                    break;
                }
            }
        }

        internal!("Dispatcher shutdown complete");
    }
}

fn log_shutdown(sig: &Result<Signal, broadcast::error::RecvError>) {
    match sig {
        Ok(signal) => internal!("Dispatcher received {signal:?}"),
        Err(e) => tracing::error!("Dispatcher shutdown channel error: {e}"),
    }
}

fn log_report(report: &BatchReport) {
    if report.claimed == 0 {
        tracing::trace!("No due jobs");
    } else {
        internal!(
            level = INFO,
            "Dispatch cycle: {} claimed, {} sent, {} retrying, {} failed, {} skipped",
            report.claimed,
            report.sent,
            report.retried,
            report.failed,
            report.skipped
        );
    }
}
