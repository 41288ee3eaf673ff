//! Messages exchanged over the control socket.
//!
//! Every request and response carries [`PROTOCOL_VERSION`]; peers only talk
//! to an identical version.

use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use courier_queue::{BatchReport, EmailJob, JobId, JobStats, JobStatus, NewJob};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

fn format_time(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub version: u32,
    pub command: RequestCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestCommand {
    Queue(QueueCommand),
    System(SystemCommand),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueCommand {
    /// Jobs in creation order, optionally only one status
    List { status: Option<JobStatus> },
    /// Everything recorded about one job
    View { id: JobId },
    /// Validate and queue a new job
    Enqueue(Box<NewJob>),
    /// Queue a sent, failed or cancelled job again
    Retry { id: JobId },
    BulkRetry { ids: Vec<JobId> },
    /// Copy a job's content to a new recipient
    Forward {
        id: JobId,
        email: String,
        name: Option<String>,
    },
    Cancel { id: JobId },
    Stats,
    /// Run a dispatch cycle now instead of waiting for the next poll
    ProcessNow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum SystemCommand {
    Ping,
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub version: u32,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    Ok,
    Data(Box<ResponseData>),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    Jobs(Vec<JobSummary>),
    Job(Box<JobDetails>),
    /// A job created by enqueue or forward
    Created(JobId),
    /// Whether a retry or cancel took effect
    Applied(bool),
    /// How many of a bulk retry were queued
    Count(usize),
    Stats(JobStats),
    Batch(BatchReport),
    Status(SystemStatus),
    Message(String),
}

/// One line of `queue list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub recipient: String,
    pub subject: String,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
}

impl From<&EmailJob> for JobSummary {
    fn from(job: &EmailJob) -> Self {
        Self {
            id: job.id,
            recipient: job.recipient_email.clone(),
            subject: job.subject.clone(),
            status: job.status,
            priority: job.priority,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            scheduled_at: job.scheduled_at,
        }
    }
}

impl Display for JobSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {:<9} p{:<3} {}/{}  {}  {}  {}",
            self.id,
            self.status,
            self.priority,
            self.attempts,
            self.max_attempts,
            format_time(&self.scheduled_at),
            self.recipient,
            self.subject
        )
    }
}

/// The full record behind `queue view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDetails(pub EmailJob);

impl Display for JobDetails {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let job = &self.0;

        writeln!(f, "ID:          {}", job.id)?;
        match &job.recipient_name {
            Some(name) => writeln!(f, "To:          {name} <{}>", job.recipient_email)?,
            None => writeln!(f, "To:          {}", job.recipient_email)?,
        }
        if let Some(original) = &job.original_recipient_email {
            writeln!(f, "Originally:  {original}")?;
        }
        if let Some(reference) = &job.recipient_ref {
            writeln!(f, "Refers to:   {reference}")?;
        }
        writeln!(f, "Subject:     {}", job.subject)?;
        writeln!(f, "Status:      {}", job.status)?;
        writeln!(f, "Priority:    {}", job.priority)?;
        writeln!(f, "Attempts:    {}/{}", job.attempts, job.max_attempts)?;
        writeln!(f, "Scheduled:   {}", format_time(&job.scheduled_at))?;
        if let Some(sent_at) = &job.sent_at {
            writeln!(f, "Sent:        {}", format_time(sent_at))?;
        }
        if job.resend_count > 0 {
            writeln!(f, "Resends:     {}", job.resend_count)?;
        }
        if let Some(original) = &job.original_sent_at {
            writeln!(f, "First sent:  {}", format_time(original))?;
        }
        if let Some(error) = &job.error_message {
            writeln!(f, "Last error:  {error}")?;
        }
        if let Some(source) = &job.forwarded_from {
            writeln!(f, "Forwarded from: {source}")?;
        }
        if let Some(key) = &job.template_key {
            writeln!(f, "Template:    {key}")?;
            for (field, value) in &job.template_data {
                writeln!(f, "  {field} = {value}")?;
            }
        }
        for attachment in &job.attachments {
            writeln!(f, "Attachment:  {attachment}")?;
        }
        writeln!(f, "Created:     {}", format_time(&job.created_at))?;
        write!(f, "Updated:     {}", format_time(&job.updated_at))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub queue_size: usize,
    pub stats: JobStats,
}

impl Request {
    #[must_use]
    pub const fn new(command: RequestCommand) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
        }
    }

    #[must_use]
    pub const fn queue(command: QueueCommand) -> Self {
        Self::new(RequestCommand::Queue(command))
    }

    #[must_use]
    pub const fn system(command: SystemCommand) -> Self {
        Self::new(RequestCommand::System(command))
    }

    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

impl Response {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Error(message.into()),
        }
    }

    #[must_use]
    pub const fn ok() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Ok,
        }
    }

    #[must_use]
    pub fn data(data: ResponseData) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Data(Box::new(data)),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self.payload, ResponsePayload::Error(_))
    }

    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use courier_common::Attachment;
    use pretty_assertions::assert_eq;

    use super::*;

    fn encode_decode<T: Serialize + serde::de::DeserializeOwned>(value: &T) -> T {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::legacy()).unwrap();
        bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())
            .unwrap()
            .0
    }

    #[test]
    fn test_enqueue_request_survives_the_wire() {
        let new = NewJob::new("a@b.com", "Hello {{name}}")
            .text("Hi")
            .attachment(Attachment::new("https://x.test/a.pdf", "a.pdf"))
            .scheduled_at(Utc::now());
        let request = Request::queue(QueueCommand::Enqueue(Box::new(new.clone())));

        let decoded = encode_decode(&request);
        assert!(decoded.is_version_compatible());
        match decoded.command {
            RequestCommand::Queue(QueueCommand::Enqueue(job)) => assert_eq!(*job, new),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_error_response() {
        let response = Response::error("Job not found");
        assert!(!response.is_success());
        assert!(Response::ok().is_success());
        assert!(Response::data(ResponseData::Applied(false)).is_success());
    }

    #[tokio::test]
    async fn test_summary_line() {
        let queue = courier_queue::JobQueue::in_memory();
        let id = queue
            .enqueue(NewJob::new("a@b.com", "Booked").text("x").priority(5))
            .await
            .unwrap();
        let summary = JobSummary::from(&queue.get(&id).unwrap());

        let line = summary.to_string();
        assert!(line.starts_with(&id.to_string()));
        assert!(line.contains("pending  "));
        assert!(line.contains("p5"));
        assert!(line.contains("0/3"));
        assert!(line.ends_with("a@b.com  Booked"));
    }
}
