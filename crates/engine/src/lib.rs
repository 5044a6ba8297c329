//! Runtime wiring for the script thread pool: configuration files, logging
//! and the async front door with the file watcher attached.

pub mod config;
pub mod engine;
pub mod logging;

pub use config::{ConfigError, RuntimeConfig};
pub use engine::{EngineError, RuntimeEngine};
