pub mod attachment;
pub mod logging;

pub use attachment::Attachment;
pub use tracing;

/// Broadcast to every long-running task when the daemon is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
