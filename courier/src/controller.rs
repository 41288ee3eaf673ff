use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use courier_common::{Signal, internal, logging};
use courier_control::{ControlError, ControlServer, DEFAULT_CONTROL_SOCKET};
use courier_queue::{
    Contact, Dispatcher, DispatcherConfig, JobQueue, MemoryDirectory, QueueOperations,
    RecipientRef, RecipientResolver, StoreConfig,
};
use courier_smtp::{SmtpConfig, SmtpTransport, Transport};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::control_handler::CourierHandler;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

/// Searched in order when [`CONFIG_ENV`] is unset
pub const DEFAULT_CONFIG_PATHS: [&str; 2] =
    ["./courier.config.ron", "/etc/courier/courier.config.ron"];

/// One contact known to the recipient resolver
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DirectoryEntry {
    pub reference: RecipientRef,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// The daemon's configuration, and everything it runs.
#[derive(Debug, Deserialize)]
pub struct Courier {
    smtp: SmtpConfig,
    #[serde(default)]
    dispatcher: DispatcherConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default = "default_control_socket")]
    control_socket: PathBuf,
    #[serde(default)]
    directory: Vec<DirectoryEntry>,
}

fn default_control_socket() -> PathBuf {
    PathBuf::from(DEFAULT_CONTROL_SOCKET)
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// The wired-up daemon, ready to serve.
pub struct Services {
    pub queue: JobQueue,
    pub dispatcher: Arc<Dispatcher>,
    pub control: ControlServer,
}

/// Finds the configuration file: `COURIER_CONFIG` if set (it must exist),
/// otherwise the first of [`DEFAULT_CONFIG_PATHS`] that does.
pub fn locate_config<F>(lookup: F) -> anyhow::Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(env_path) = lookup(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
    {
        return Ok(path);
    }

    let paths_tried = DEFAULT_CONFIG_PATHS
        .iter()
        .map(|p| format!("  - {p}"))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

#[tracing::instrument(level = tracing::Level::TRACE)]
async fn shutdown_requested() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    };

    Ok(())
}

impl Courier {
    /// Reads a RON configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_ron(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn from_ron(content: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(content)?)
    }

    pub const fn smtp(&self) -> &SmtpConfig {
        &self.smtp
    }

    pub const fn dispatcher(&self) -> &DispatcherConfig {
        &self.dispatcher
    }

    pub const fn store(&self) -> &StoreConfig {
        &self.store
    }

    pub fn control_socket(&self) -> &Path {
        &self.control_socket
    }

    pub fn directory(&self) -> &[DirectoryEntry] {
        &self.directory
    }

    /// Applies the SMTP environment overrides, validates the result and
    /// wires everything to a real SMTP transport.
    pub async fn init(self) -> anyhow::Result<Services> {
        let mut smtp = self.smtp.clone();
        smtp.apply_env()?;
        smtp.validate()?;

        self.init_with(Arc::new(SmtpTransport::new(smtp))).await
    }

    /// Restores the queue from the configured store and wires it to
    /// `transport` and the control socket.
    pub async fn init_with(self, transport: Arc<dyn Transport>) -> anyhow::Result<Services> {
        self.dispatcher
            .validate()
            .context("Invalid dispatcher configuration")?;

        let store = self.store.build()?;
        let queue = JobQueue::restore(store).await?;
        internal!(
            level = INFO,
            "Restored {} job(s) from {:?}",
            queue.len(),
            self.store
        );

        let directory: MemoryDirectory = self
            .directory
            .into_iter()
            .map(|entry| {
                (
                    entry.reference,
                    Contact::new(entry.email, entry.name.as_deref()),
                )
            })
            .collect();
        let resolver = RecipientResolver::new(Arc::new(directory));

        let dispatcher = Arc::new(Dispatcher::new(
            self.dispatcher,
            queue.clone(),
            resolver.clone(),
            transport,
        ));

        let handler = CourierHandler::new(
            QueueOperations::new(queue.clone(), resolver),
            Arc::clone(&dispatcher),
        );
        let control = ControlServer::new(self.control_socket, Arc::new(handler))?;

        Ok(Services {
            queue,
            dispatcher,
            control,
        })
    }

    /// Run the daemon until it is told to stop
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid, the store can't be restored or
    /// the control socket can't be bound.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        let services = self.init().await?;

        internal!(level = INFO, "Courier running");

        let ret = services
            .serve(&SHUTDOWN_BROADCAST, shutdown_requested())
            .await;

        internal!(level = INFO, "Shutting down...");

        ret
    }
}

impl Services {
    /// Runs the dispatcher and the control server until `stop` resolves, then
    /// broadcasts [`Signal::Shutdown`] on `shutdown` and waits for both to
    /// wind down. A second CTRL+C abandons the wait.
    pub async fn serve<S>(
        self,
        shutdown: &broadcast::Sender<Signal>,
        stop: S,
    ) -> anyhow::Result<()>
    where
        S: Future<Output = anyhow::Result<()>>,
    {
        let Self {
            dispatcher,
            control,
            ..
        } = self;

        let control_rx = shutdown.subscribe();
        let dispatcher_rx = shutdown.subscribe();

        let components = async move {
            tokio::try_join!(control.serve(control_rx), async move {
                dispatcher.serve(dispatcher_rx).await;
                Ok::<_, ControlError>(())
            })
            .map(|((), ())| ())
        };
        tokio::pin!(components);

        tokio::select! {
            r = &mut components => r.map_err(anyhow::Error::from),
            r = stop => {
                r?;
                shutdown
                    .send(Signal::Shutdown)
                    .map_err(|e| anyhow::anyhow!("Failed to broadcast shutdown: {e}"))?;

                tokio::select! {
                    r = &mut components => r.map_err(anyhow::Error::from),
                    _ = tokio::signal::ctrl_c() => {
                        internal!(level = WARN, "Forced shutdown");
                        Ok(())
                    }
                }
            }
        }
    }
}
