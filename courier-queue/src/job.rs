//! The persisted job record and the producer-facing input for creating one.

use core::fmt::{self, Display, Formatter};
use std::{collections::BTreeMap, str::FromStr};

use chrono::{DateTime, Utc};
use courier_common::Attachment;
use courier_smtp::Email;
use serde::{Deserialize, Serialize};

use crate::{error::ValidationError, template};

/// Opaque key/value pairs a job was rendered from. Never reinterpreted here.
pub type TemplateData = BTreeMap<String, String>;

/// Attempts allowed when a producer doesn't say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Identifier for a queued job
///
/// A ULID, so ids sort by creation time and double as file names for the
/// file backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(ulid::Ulid);

impl JobId {
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Parses an id from a file name like `01ARZ3NDEKTSV4RRFFQ69G5FAV.bin`.
    ///
    /// Anything with a path separator, a traversal pattern or a stem that
    /// isn't a ULID is rejected.
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains(['/', '\\']) || filename.contains("..") {
            return None;
        }

        let stem = filename.strip_suffix(".bin")?;
        ulid::Ulid::from_string(stem).ok().map(Self)
    }
}

impl Display for JobId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s.trim()).map(Self)
    }
}

impl Serialize for JobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a job is in its delivery cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    /// Claimed by a dispatcher for the current cycle
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Sending,
        Self::Sent,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Statuses an operator may put back in the queue.
    #[must_use]
    pub const fn is_requeueable(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }
}

impl Display for JobStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.pad(match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown job status '{s}'"))
    }
}

/// Weak reference to the entity a job was addressed to.
///
/// Only ever used to look up the entity's current address; nothing cascades
/// if the entity disappears.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecipientRef {
    Trainer(String),
    User(String),
    Delegate(String),
}

impl Display for RecipientRef {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trainer(id) => write!(fmt, "trainer:{id}"),
            Self::User(id) => write!(fmt, "user:{id}"),
            Self::Delegate(id) => write!(fmt, "delegate:{id}"),
        }
    }
}

impl FromStr for RecipientRef {
    type Err = String;

    /// Parses `trainer:<id>`, `user:<id>` or `delegate:<id>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("expected '<kind>:<id>', got '{s}'"))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(format!("missing id in '{s}'"));
        }

        match kind.trim().to_ascii_lowercase().as_str() {
            "trainer" => Ok(Self::Trainer(id.to_string())),
            "user" => Ok(Self::User(id.to_string())),
            "delegate" => Ok(Self::Delegate(id.to_string())),
            other => Err(format!("unknown recipient kind '{other}'")),
        }
    }
}

/// A queued email and its delivery history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailJob {
    pub id: JobId,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub template_key: Option<String>,
    pub template_data: TemplateData,
    pub attachments: Vec<Attachment>,
    /// Higher is dispatched first
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be claimed
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Times a job that had reached `sent` was queued again
    pub resend_count: u32,
    /// First-ever `sent_at`, kept across resends
    pub original_sent_at: Option<DateTime<Utc>>,
    /// Address before the resolver first changed it
    pub original_recipient_email: Option<String>,
    pub recipient_ref: Option<RecipientRef>,
    /// Source job when this one was created by a forward
    pub forwarded_from: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl EmailJob {
    /// Builds a fresh pending job. Callers validate `new` first.
    pub(crate) fn new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::generate(),
            recipient_email: new.recipient_email.trim().to_string(),
            recipient_name: new.recipient_name,
            subject: new.subject,
            html_body: new.html_body,
            text_body: new.text_body,
            template_key: new.template_key,
            template_data: new.template_data,
            attachments: new.attachments,
            priority: new.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts,
            scheduled_at: new.scheduled_at.unwrap_or(now),
            sent_at: None,
            error_message: None,
            resend_count: 0,
            original_sent_at: None,
            original_recipient_email: None,
            recipient_ref: new.recipient_ref,
            forwarded_from: None,
            created_at: now,
            updated_at: now,
            claimed_at: None,
        }
    }

    /// The content of this job as handed to a transport.
    #[must_use]
    pub fn to_email(&self) -> Email {
        Email {
            to_email: self.recipient_email.clone(),
            to_name: self.recipient_name.clone(),
            subject: self.subject.clone(),
            html_body: self.html_body.clone(),
            text_body: self.text_body.clone(),
            attachments: self.attachments.clone(),
        }
    }

    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }
}

/// What a producer supplies to queue an email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub template_key: Option<String>,
    pub template_data: TemplateData,
    pub attachments: Vec<Attachment>,
    pub priority: i32,
    pub max_attempts: u32,
    /// Defer the first attempt; `None` means as soon as possible
    pub scheduled_at: Option<DateTime<Utc>>,
    pub recipient_ref: Option<RecipientRef>,
}

impl Default for NewJob {
    fn default() -> Self {
        Self {
            recipient_email: String::new(),
            recipient_name: None,
            subject: String::new(),
            html_body: None,
            text_body: None,
            template_key: None,
            template_data: TemplateData::new(),
            attachments: Vec::new(),
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: None,
            recipient_ref: None,
        }
    }
}

impl NewJob {
    pub fn new(recipient_email: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            recipient_email: recipient_email.into(),
            subject: subject.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn recipient_name(mut self, name: impl Into<String>) -> Self {
        self.recipient_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn html(mut self, body: impl Into<String>) -> Self {
        self.html_body = Some(body.into());
        self
    }

    #[must_use]
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.text_body = Some(body.into());
        self
    }

    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    #[must_use]
    pub fn recipient_ref(mut self, reference: RecipientRef) -> Self {
        self.recipient_ref = Some(reference);
        self
    }

    #[must_use]
    pub fn template(mut self, key: impl Into<String>, data: TemplateData) -> Self {
        self.template_key = Some(key.into());
        self.template_data = data;
        self
    }

    #[must_use]
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Substitutes `{{placeholders}}` in the subject and bodies from
    /// `template_data`.
    #[must_use]
    pub fn render_template(mut self) -> Self {
        self.subject = template::render(&self.subject, &self.template_data);
        self.html_body = self
            .html_body
            .map(|body| template::render(&body, &self.template_data));
        self.text_body = self
            .text_body
            .map(|body| template::render(&body, &self.template_data));
        self
    }

    /// Checks the fields a job cannot be sent without.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let email = self.recipient_email.trim();
        if email.is_empty() {
            return Err(ValidationError::MissingRecipient);
        }
        if !is_plausible_address(email) {
            return Err(ValidationError::InvalidRecipient(email.to_string()));
        }

        if self.subject.trim().is_empty() {
            return Err(ValidationError::MissingSubject);
        }

        let has_body = |body: Option<&String>| body.is_some_and(|b| !b.trim().is_empty());
        if !has_body(self.html_body.as_ref()) && !has_body(self.text_body.as_ref()) {
            return Err(ValidationError::MissingBody);
        }

        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidMaxAttempts);
        }

        Ok(())
    }
}

/// `local@domain` with both halves present and no whitespace or brackets that
/// would break the SMTP envelope.
pub(crate) fn is_plausible_address(email: &str) -> bool {
    if email.contains(|c: char| c.is_whitespace() || c == '<' || c == '>') {
        return false;
    }

    email
        .rsplit_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty())
}

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: usize,
    pub sending: usize,
    pub sent: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub(crate) const fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Sending => self.sending += 1,
            JobStatus::Sent => self.sent += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.pending + self.sending + self.sent + self.failed + self.cancelled
    }
}
