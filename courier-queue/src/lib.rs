//! Durable queue of transactional emails.
//!
//! Producers [`enqueue`](JobQueue::enqueue) jobs; a [`Dispatcher`] claims the
//! due ones, refreshes their recipients through a [`RecipientResolver`] and
//! hands them to a [`Transport`](courier_smtp::Transport), recording the
//! outcome and scheduling retries. Operators act on finished jobs through
//! [`QueueOperations`].

pub mod error;
pub mod job;
pub mod operations;
pub mod policy;
pub mod processor;
pub mod queue;
pub mod resolver;
pub mod store;
pub mod template;

pub use error::{ConfigError, QueueError, ResolverError, StoreError, ValidationError};
pub use job::{EmailJob, JobId, JobStats, JobStatus, NewJob, RecipientRef, TemplateData};
pub use operations::QueueOperations;
pub use policy::RetryPolicy;
pub use processor::{BatchReport, Dispatcher, DispatcherConfig, Outcome};
pub use queue::JobQueue;
pub use resolver::{Contact, ContactDirectory, MemoryDirectory, RecipientResolver, Resolution};
pub use store::{BackingStore, FileBackingStore, MemoryBackingStore, StoreConfig};
