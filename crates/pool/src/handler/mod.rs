//! What a pool thread does between two script runs.
//!
//! A thread always runs exactly one handler. Handlers are only swapped through
//! the transition protocol in `PhpThread::set_handler`, which waits for the
//! thread to reach a safe state first.

mod inactive;
mod regular;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

pub(crate) use inactive::InactiveHandler;
pub(crate) use regular::RegularHandler;
pub(crate) use worker::WorkerHandler;

use crate::arena::PinArena;
use crate::error::{PoolError, PoolResult};
use crate::pool::PoolInner;
use crate::request::RequestContext;
use crate::thread::PhpThread;
use crate::worker::Worker;

/// Outcome of one `before_execution` step of a concrete handler.
pub(crate) enum Step {
    Run(PathBuf),
    /// A new handler is pending on the thread.
    Swap,
    Stop,
}

pub(crate) enum Handler {
    Inactive(InactiveHandler),
    Regular(RegularHandler),
    Worker(WorkerHandler),
}

impl Handler {
    pub(crate) fn inactive() -> Self {
        Handler::Inactive(InactiveHandler)
    }

    pub(crate) fn regular() -> Self {
        Handler::Regular(RegularHandler::default())
    }

    pub(crate) fn worker(worker: Arc<Worker>) -> Self {
        Handler::Worker(WorkerHandler::new(worker))
    }

    pub(crate) fn name(&self) -> String {
        match self {
            Handler::Inactive(_) => "Inactive PHP Thread".to_string(),
            Handler::Regular(_) => "Regular PHP Thread".to_string(),
            Handler::Worker(handler) => {
                format!("Worker PHP Thread - {}", handler.worker().file_name().display())
            }
        }
    }

    /// The script to run next, or `None` when the thread should exit.
    pub(crate) fn before_execution(
        &mut self,
        pool: &PoolInner,
        thread: &PhpThread,
        arena: &mut PinArena,
    ) -> PoolResult<Option<PathBuf>> {
        loop {
            let step = match self {
                Handler::Inactive(handler) => handler.before_execution(thread)?,
                Handler::Regular(handler) => handler.before_execution(pool, thread, arena)?,
                Handler::Worker(handler) => handler.before_execution(thread)?,
            };
            match step {
                Step::Run(script) => return Ok(Some(script)),
                Step::Stop => return Ok(None),
                Step::Swap => *self = thread.transition_to_new_handler()?,
            }
        }
    }

    pub(crate) fn after_execution(
        &mut self,
        pool: &PoolInner,
        thread: &PhpThread,
        exit_status: i32,
    ) -> PoolResult<()> {
        match self {
            Handler::Inactive(_) => Err(PoolError::UnexpectedState {
                handler: "inactive thread executed a script",
                state: thread.state().get(),
            }),
            Handler::Regular(handler) => handler.after_execution(thread, exit_status),
            Handler::Worker(handler) => handler.after_execution(pool, thread, exit_status),
        }
    }

    pub(crate) fn request_context(&self) -> Option<Arc<RequestContext>> {
        match self {
            Handler::Inactive(_) => None,
            Handler::Regular(handler) => handler.request_context(),
            Handler::Worker(handler) => handler.request_context(),
        }
    }

    /// Drop every registry reference to `thread`; used when a thread dies on a
    /// fatal error.
    pub(crate) fn detach(&self, pool: &PoolInner, thread: &PhpThread) {
        match self {
            Handler::Inactive(_) => {}
            Handler::Regular(_) => pool.regular().detach(thread),
            Handler::Worker(handler) => handler.worker().detach_thread(thread),
        }
    }
}
