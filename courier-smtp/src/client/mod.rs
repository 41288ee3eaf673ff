//! Low-level SMTP client.
//!
//! The client is deliberately small: it knows how to write a command, read a
//! (possibly multi-line) reply, upgrade the socket with STARTTLS and stream a
//! dot-stuffed DATA payload. Deciding which replies are acceptable is left to
//! the caller.
//!
//! ```no_run
//! use courier_smtp::client::SmtpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SmtpClient::connect("localhost:2525", "localhost".to_string()).await?;
//! let greeting = client.read_greeting().await?;
//! assert!(greeting.is_success());
//!
//! client.ehlo("client.example.com").await?;
//! client.mail_from("sender@example.com").await?;
//! client.rcpt_to("recipient@example.com").await?;
//! client.data().await?;
//! client.send_data("Subject: Test\r\n\r\nHello World").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

#[allow(clippy::module_inception)]
mod client;
mod error;
mod message;
mod response;

pub use client::{SmtpClient, dot_stuff};
pub use error::{ClientError, Result};
pub use message::MessageBuilder;
pub use response::{Response, ResponseLine};
