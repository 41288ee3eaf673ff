//! Client side of the control socket.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::net::UnixStream;
use tracing::debug;

use crate::{
    ControlError, Request, Response, ResponsePayload, Result,
    frame::{MAX_RESPONSE_SIZE, read_frame, write_frame},
    protocol::PROTOCOL_VERSION,
};

#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Bound on the whole request/response exchange. `process-now` waits for
    /// a full dispatch cycle, so callers issuing it may want longer.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sends `request` on a fresh connection.
    ///
    /// An error payload from the daemon becomes [`ControlError::Rejected`].
    pub async fn send_request(&self, request: Request) -> Result<Response> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| ControlError::Timeout)?
    }

    async fn exchange(&self, request: Request) -> Result<Response> {
        debug!("Connecting to control socket: {}", self.socket_path.display());
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        write_frame(&mut stream, &request).await?;
        let response: Response = read_frame(&mut stream, MAX_RESPONSE_SIZE).await?;

        if !response.is_version_compatible() {
            return Err(ControlError::IncompatibleVersion {
                peer: response.version,
                local: PROTOCOL_VERSION,
            });
        }

        if let ResponsePayload::Error(message) = response.payload {
            return Err(ControlError::Rejected(message));
        }

        Ok(response)
    }

    /// Fails fast with a readable error when no daemon has created the
    /// socket.
    pub fn check_socket_exists(&self) -> Result<()> {
        if self.socket_path.exists() {
            Ok(())
        } else {
            Err(ControlError::InvalidSocketPath(format!(
                "{} does not exist; is the courier daemon running?",
                self.socket_path.display()
            )))
        }
    }
}
