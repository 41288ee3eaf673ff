//! SMTP submission for the courier mail queue.
//!
//! [`client::SmtpClient`] speaks the wire protocol one command at a time,
//! [`client::MessageBuilder`] renders the MIME document and
//! [`transport::SmtpTransport`] strings them together into a single,
//! deadline-bounded delivery over one connection.

pub mod client;
pub mod config;
pub mod transport;

pub use config::{ConfigError, SmtpConfig, SmtpTimeouts, TlsMode};
pub use transport::{Email, SmtpTransport, Stage, Transport, TransportError};
