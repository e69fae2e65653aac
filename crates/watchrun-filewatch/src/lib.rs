#![deny(clippy::all)]

//! Recursive filesystem watching for watchrun.
//!
//! Layered as: an inotify-backed event source owning the raw watch
//! descriptors, a glob filter projecting paths in or out, and a recursive
//! monitor that keeps the watch set in step with the live tree and yields
//! classified [`MonitorResult`]s.

pub mod events;
pub mod filter;
pub mod monitor;
pub mod source;

pub use events::{encode_change_set, EventClasses, EventKind, MonitorResult};
pub use filter::{GlobFilter, OverrideSet};
pub use monitor::{MonitorConfig, MonitorError, RecursiveMonitor};
pub use source::{InotifySource, SourceError};
