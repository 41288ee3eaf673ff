//! Error types for the courier-queue crate.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::job::{JobId, RecipientRef};

/// Top-level error for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid job: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// A job was rejected at enqueue time. Nothing is persisted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("recipient email is required")]
    MissingRecipient,

    #[error("'{0}' is not a valid email address")]
    InvalidRecipient(String),

    #[error("subject is required")]
    MissingSubject,

    #[error("an HTML or text body is required")]
    MissingBody,

    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,
}

/// Failures of the durable layer under the queue.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Invalid store path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },
}

/// Dispatcher settings that would misbehave at runtime.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("{field} of {secs}s is too large")]
    RetryDelayTooLarge { field: &'static str, secs: u64 },

    #[error("retry_jitter_factor must be between 0.0 and 1.0, got {0}")]
    InvalidJitter(f64),
}

/// A weak reference could not be refreshed. Never fatal to a send.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolverError {
    #[error("{0} no longer exists")]
    NotFound(RecipientRef),

    #[error("Contact directory unavailable: {0}")]
    Directory(String),

    #[error("{reference} has an unusable address: {email:?}")]
    InvalidContact {
        reference: RecipientRef,
        email: String,
    },
}
