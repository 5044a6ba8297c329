//! The seam between the pool and the embedded script engine.

use std::collections::HashMap;
use std::ffi::{NulError, c_char};
use std::path::Path;
use std::sync::Arc;

use crate::arena::PinArena;
use crate::error::{PoolError, PoolResult};
use crate::handler::Handler;
use crate::pool::PoolInner;
use crate::request::RequestContext;
use crate::thread::PhpThread;

/// Exit status recorded when `run_script` panics.
pub const CRASH_EXIT_STATUS: i32 = 255;

/// Environment variable present in the environment of every worker script.
pub const WORKER_MODE_ENV: &str = "PHP_WORKER_MODE";

/// The interpreter the pool drives. The pool never looks inside it: a script
/// run is a call to `run_script`, exit status 0 means the script completed
/// normally and anything else is a crash.
pub trait ScriptEngine: Send + Sync + 'static {
    /// Called once before any thread boots.
    fn initialize(&self) -> Result<(), String> {
        Ok(())
    }

    /// Called on the pool thread right after it was spawned.
    fn thread_started(&self, _index: usize) {}

    /// Called on the pool thread right before it exits.
    fn thread_stopped(&self, _index: usize) {}

    /// Run one script to completion and return its exit status.
    ///
    /// Worker scripts stay inside this call and pull requests through
    /// `ScriptContext::wait_for_worker_request` until it returns false.
    fn run_script(&self, ctx: &mut ScriptContext<'_>, script: &Path) -> i32;

    /// Drop compiled scripts; called once per worker restart.
    fn reset_cache(&self) {}
}

/// What a running script sees of its thread.
pub struct ScriptContext<'a> {
    pool: &'a PoolInner,
    thread: &'a PhpThread,
    handler: &'a mut Handler,
    arena: &'a mut PinArena,
}

impl<'a> ScriptContext<'a> {
    pub(crate) fn new(
        pool: &'a PoolInner,
        thread: &'a PhpThread,
        handler: &'a mut Handler,
        arena: &'a mut PinArena,
    ) -> Self {
        Self {
            pool,
            thread,
            handler,
            arena,
        }
    }

    pub fn thread_index(&self) -> usize {
        self.thread.index()
    }

    /// The request being served: the bound request, or the warm-up request of a
    /// worker script that has not reached its request loop yet.
    pub fn request(&self) -> Option<Arc<RequestContext>> {
        self.handler.request_context()
    }

    pub fn is_worker(&self) -> bool {
        matches!(self.handler, Handler::Worker(_))
    }

    pub fn worker_name(&self) -> Option<&str> {
        match &*self.handler {
            Handler::Worker(handler) => Some(handler.worker().name()),
            _ => None,
        }
    }

    /// The worker environment overlaid with the environment of the current request.
    pub fn env(&self) -> HashMap<String, String> {
        let mut env = match &*self.handler {
            Handler::Worker(handler) => handler.worker().env().clone(),
            _ => HashMap::new(),
        };
        if let Some(request) = self.request() {
            env.extend(
                request
                    .env()
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone())),
            );
        }
        env
    }

    pub fn env_var(&self, key: &str) -> Option<String> {
        self.env().remove(key)
    }

    /// Block until the next request for this worker arrives. Returns false when
    /// the script should exit its request loop (restart, handler change or
    /// shutdown).
    pub fn wait_for_worker_request(&mut self) -> PoolResult<bool> {
        let result = match &mut *self.handler {
            Handler::Worker(handler) => {
                handler.wait_for_worker_request(self.pool, self.thread, self.arena)
            }
            _ => Err(PoolError::NotAWorkerThread),
        };
        self.pool.check_fatal(result)
    }

    /// Complete the request bound by `wait_for_worker_request`.
    pub fn finish_worker_request(&mut self) -> PoolResult<()> {
        let result = match &mut *self.handler {
            Handler::Worker(handler) => handler.finish_worker_request(self.thread),
            _ => Err(PoolError::NotAWorkerThread),
        };
        self.pool.check_fatal(result)
    }

    /// Wait for a request, serve it with `serve` and finish it.
    /// Returns false when the worker loop should end.
    pub fn handle_request<F>(&mut self, serve: F) -> PoolResult<bool>
    where
        F: FnOnce(&RequestContext),
    {
        if !self.wait_for_worker_request()? {
            return Ok(false);
        }
        if let Some(request) = self.request() {
            serve(&request);
        }
        self.finish_worker_request()?;
        Ok(true)
    }

    /// Hand out a C string that stays valid until the script run (or the
    /// current worker request) ends.
    pub fn pin_c_string(&mut self, value: &str) -> Result<*const c_char, NulError> {
        self.arena.pin_c_string(value)
    }

    pub fn pinned_count(&self) -> usize {
        self.arena.len()
    }
}
