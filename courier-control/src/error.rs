use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Control socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed control frame: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Could not encode control frame: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// The peer announced a frame bigger than we accept.
    #[error("Control frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("Peer speaks control protocol v{peer}, this build speaks v{local}")]
    IncompatibleVersion { peer: u32, local: u32 },

    /// The daemon understood the request and refused it.
    #[error("{0}")]
    Rejected(String),

    #[error("Control connection closed by peer")]
    ConnectionClosed,

    #[error("Control request timed out")]
    Timeout,

    #[error("Invalid control socket path: {0}")]
    InvalidSocketPath(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;
