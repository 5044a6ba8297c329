use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("invalid watch pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("unable to resolve the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("unable to watch {dir}: {source}")]
    Watch {
        dir: String,
        #[source]
        source: notify::Error,
    },

    #[error("unable to start the file watcher: {0}")]
    Notify(#[from] notify::Error),
}
