//! File watching for worker restarts.
//!
//! Watch patterns name a directory plus optional glob segments separated by
//! `**`. Matching filesystem events are debounced and reported in batches, one
//! batch per quiet period, so a burst of writes triggers a single restart.

mod error;
pub mod pattern;
pub mod watcher;

pub use error::WatchError;
pub use pattern::WatchPattern;
pub use watcher::{DEFAULT_DEBOUNCE, FileWatcher, WatchEntry};
