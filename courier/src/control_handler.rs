//! Answers control socket requests against the running queue.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::Utc;
use courier_common::internal;
use courier_control::{
    CommandHandler, ControlError, JobDetails, JobSummary, QueueCommand, Request, RequestCommand,
    Response, ResponseData, SystemCommand, SystemStatus,
};
use courier_queue::{Dispatcher, JobQueue, QueueError, QueueOperations};

/// Handler for control commands
pub struct CourierHandler {
    operations: QueueOperations,
    /// Runs `process-now` cycles
    dispatcher: Arc<Dispatcher>,
    /// Server start time for uptime calculation
    start_time: Instant,
}

impl CourierHandler {
    #[must_use]
    pub fn new(operations: QueueOperations, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            operations,
            dispatcher,
            start_time: Instant::now(),
        }
    }

    const fn queue(&self) -> &JobQueue {
        self.operations.queue()
    }
}

fn rejected(err: &QueueError) -> ControlError {
    ControlError::Rejected(err.to_string())
}

#[async_trait]
impl CommandHandler for CourierHandler {
    async fn handle_request(&self, request: Request) -> courier_control::Result<Response> {
        match request.command {
            RequestCommand::Queue(command) => self.handle_queue_command(command).await,
            RequestCommand::System(command) => Ok(self.handle_system_command(command)),
        }
    }
}

impl CourierHandler {
    async fn handle_queue_command(
        &self,
        command: QueueCommand,
    ) -> courier_control::Result<Response> {
        let data = match command {
            QueueCommand::List { status } => ResponseData::Jobs(
                self.queue()
                    .list(status)
                    .iter()
                    .map(JobSummary::from)
                    .collect(),
            ),

            QueueCommand::View { id } => {
                let job = self.queue().get(&id).map_err(|e| rejected(&e))?;
                ResponseData::Job(Box::new(JobDetails(job)))
            }

            QueueCommand::Enqueue(new) => {
                let id = self.queue().enqueue(*new).await.map_err(|e| rejected(&e))?;
                internal!(level = INFO, "Job {id} enqueued over the control socket");
                ResponseData::Created(id)
            }

            QueueCommand::Retry { id } => {
                ResponseData::Applied(self.operations.retry(&id).await.map_err(|e| rejected(&e))?)
            }

            QueueCommand::BulkRetry { ids } => {
                ResponseData::Count(self.operations.bulk_retry(&ids).await)
            }

            QueueCommand::Forward { id, email, name } => ResponseData::Created(
                self.operations
                    .forward(&id, &email, name.as_deref())
                    .await
                    .map_err(|e| rejected(&e))?,
            ),

            QueueCommand::Cancel { id } => {
                ResponseData::Applied(self.operations.cancel(&id).await.map_err(|e| rejected(&e))?)
            }

            QueueCommand::Stats => ResponseData::Stats(self.queue().stats()),

            QueueCommand::ProcessNow => {
                ResponseData::Batch(self.dispatcher.process_batch(Utc::now()).await)
            }
        };

        Ok(Response::data(data))
    }

    fn handle_system_command(&self, command: SystemCommand) -> Response {
        match command {
            SystemCommand::Ping => Response::ok(),
            SystemCommand::Status => Response::data(ResponseData::Status(SystemStatus {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: self.start_time.elapsed().as_secs(),
                queue_size: self.queue().len(),
                stats: self.queue().stats(),
            })),
        }
    }
}
