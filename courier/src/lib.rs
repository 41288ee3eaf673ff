//! The courier daemon: configuration, startup and the control handler that
//! ties the queue, the dispatcher and the control socket together.

pub mod control_handler;
pub mod controller;

pub use controller::{Courier, DirectoryEntry, Services, locate_config};
