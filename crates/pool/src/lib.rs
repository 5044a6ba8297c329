//! Script thread pool.
//!
//! A fixed set of thread slots, each either reserved or backed by an OS
//! thread running one handler at a time: inactive, regular (one script per
//! request) or worker (a resident script pulling requests in a loop).
//! Requests are handed to idle threads without blocking, or queued with
//! autoscaling and a timeout when every thread is busy.

pub mod arena;
pub mod backoff;
pub mod config;
pub mod debug;
pub mod error;
mod handler;
pub mod pool;
pub mod request;
mod scaling;
mod scheduler;
pub mod script;
pub mod state;
pub mod thread;
pub mod worker;

pub use backoff::ExponentialBackoff;
pub use config::{AUTO_MAX_THREADS, PoolConfig, ScalingConfig, WorkerConfig};
pub use debug::{DebugState, ThreadDebugState};
pub use error::{PoolError, PoolResult};
pub use pool::{FatalHandler, ThreadPool, exit_on_fatal};
pub use request::{RequestBuilder, RequestContext, Response};
pub use script::{CRASH_EXIT_STATUS, ScriptContext, ScriptEngine, WORKER_MODE_ENV};
pub use state::StateId;
pub use worker::Worker;
