use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The server sent something that isn't an SMTP reply
    #[error("Malformed reply: {0}")]
    ParseError(String),

    #[error("Reply exceeds {max} bytes")]
    ReplyTooLarge { max: usize },

    #[error("TLS error: {0}")]
    TlsError(String),

    /// An argument would have split the command into several lines
    #[error("Line break in command argument: {0:?}")]
    LineBreak(String),

    /// The server hung up, or the stream was already closed
    #[error("Connection closed by server")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, ClientError>;
