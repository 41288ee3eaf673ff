//! Control socket for a running courier daemon
//!
//! Operators list, inspect, enqueue, retry, forward and cancel jobs, and
//! trigger dispatch cycles, over a Unix domain socket. Each connection
//! carries one length-prefixed bincode [`Request`] and its [`Response`].

pub mod client;
pub mod error;
mod frame;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use error::{ControlError, Result};
pub use protocol::{
    JobDetails, JobSummary, PROTOCOL_VERSION, QueueCommand, Request, RequestCommand, Response,
    ResponseData, ResponsePayload, SystemCommand, SystemStatus,
};
pub use server::{CommandHandler, ControlServer};

/// Socket path used when none is configured
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/courier.sock";
