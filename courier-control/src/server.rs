//! Control server: one request and one response per connection.

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use courier_common::{Signal, incoming, outgoing};
use tokio::{
    net::{UnixListener, UnixStream},
    sync::broadcast,
};
use tracing::{debug, error, info, warn};

use crate::{
    ControlError, Request, Response, Result,
    frame::{MAX_REQUEST_SIZE, read_frame, write_frame},
    protocol::PROTOCOL_VERSION,
};

/// Read and write deadline for a single connection.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Turns decoded requests into responses.
///
/// An `Err` is sent back to the client as an error response.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle_request(&self, request: Request) -> Result<Response>;
}

pub struct ControlServer {
    socket_path: PathBuf,
    handler: Arc<dyn CommandHandler>,
}

impl ControlServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Self> {
        let socket_path = socket_path.into();
        if socket_path.as_os_str().is_empty() {
            return Err(ControlError::InvalidSocketPath(
                "socket path is empty".to_string(),
            ));
        }
        if socket_path.is_dir() {
            return Err(ControlError::InvalidSocketPath(format!(
                "{} is a directory",
                socket_path.display()
            )));
        }

        Ok(Self {
            socket_path,
            handler,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the socket and answers requests until a shutdown signal.
    ///
    /// A socket file left behind by a crashed daemon is replaced; one that
    /// still accepts connections means another daemon is running and is an
    /// error.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        let listener = self.bind().await?;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    warn!("Control connection failed: {e}");
                                }
                            });
                        }
                        Err(e) => error!("Error accepting control connection: {e}"),
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(signal) => info!("Control server received {signal:?}, shutting down"),
                        Err(e) => error!("Control server shutdown channel error: {e}"),
                    }
                    break;
                }
            }
        }

        if self.socket_path.exists() {
            debug!("Removing socket file: {}", self.socket_path.display());
            let _ = tokio::fs::remove_file(&self.socket_path).await;
        }

        Ok(())
    }

    async fn bind(&self) -> Result<UnixListener> {
        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return Err(ControlError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!(
                        "Socket already in use by a running daemon: {}",
                        self.socket_path.display()
                    ),
                )));
            }

            info!("Removing stale socket file: {}", self.socket_path.display());
            tokio::fs::remove_file(&self.socket_path).await?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            let mut perms = tokio::fs::metadata(&self.socket_path).await?.permissions();
            perms.set_mode(0o600);
            tokio::fs::set_permissions(&self.socket_path, perms).await?;
        }

        info!(
            "Control socket listening on {} (mode 0600)",
            self.socket_path.display()
        );
        Ok(listener)
    }

    async fn handle_connection(
        mut stream: UnixStream,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<()> {
        let request: Request = tokio::time::timeout(
            IO_TIMEOUT,
            read_frame(&mut stream, MAX_REQUEST_SIZE),
        )
        .await
        .map_err(|_| ControlError::Timeout)??;

        incoming!("Control request: {request:?}");

        let response = if request.is_version_compatible() {
            match handler.handle_request(request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Control request failed: {e}");
                    Response::error(e.to_string())
                }
            }
        } else {
            Response::error(
                ControlError::IncompatibleVersion {
                    peer: request.version,
                    local: PROTOCOL_VERSION,
                }
                .to_string(),
            )
        };

        outgoing!("Control response: {response:?}");

        tokio::time::timeout(IO_TIMEOUT, write_frame(&mut stream, &response))
            .await
            .map_err(|_| ControlError::Timeout)??;

        Ok(())
    }
}
