use std::ffi::NulError;
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::select;

use crate::arena::PinArena;
use crate::error::{PoolError, PoolResult};
use crate::handler::Step;
use crate::pool::PoolInner;
use crate::request::{RequestContext, STATUS_BAD_REQUEST};
use crate::state::StateId;
use crate::thread::PhpThread;

/// Runs one script per request, pulling requests off the shared regular queue.
#[derive(Default)]
pub(crate) struct RegularHandler {
    request: Option<Arc<RequestContext>>,
}

impl RegularHandler {
    pub(crate) fn before_execution(
        &mut self,
        pool: &PoolInner,
        thread: &PhpThread,
        arena: &mut PinArena,
    ) -> PoolResult<Step> {
        let state = thread.state();
        loop {
            match state.get() {
                StateId::TransitionRequested => {
                    pool.regular().detach(thread);
                    return Ok(Step::Swap);
                }
                StateId::TransitionComplete => state.set(StateId::Ready)?,
                StateId::Ready => {
                    if let Some(script) = self.wait_for_request(pool, thread, arena)? {
                        return Ok(Step::Run(script));
                    }
                }
                StateId::ShuttingDown => {
                    pool.regular().detach(thread);
                    return Ok(Step::Stop);
                }
                other => {
                    return Err(PoolError::UnexpectedState {
                        handler: "regular",
                        state: other,
                    });
                }
            }
        }
    }

    /// `None` sends the thread back through `before_execution`.
    fn wait_for_request(
        &mut self,
        pool: &PoolInner,
        thread: &PhpThread,
        arena: &mut PinArena,
    ) -> PoolResult<Option<PathBuf>> {
        let state = thread.state();
        let drain = thread.drain_signal();

        state.mark_as_waiting(true);
        let request = select! {
            recv(drain) -> _ => None,
            recv(pool.regular().requests()) -> request => request.ok(),
        };
        state.mark_as_waiting(false);

        let Some(request) = request else {
            return Ok(None);
        };
        state.compare_and_swap(StateId::Ready, StateId::Busy)?;

        if let Err(err) = prepare(arena, &request) {
            request.reject(STATUS_BAD_REQUEST, &format!("Invalid request: {err}"));
            arena.clear();
            state.compare_and_swap(StateId::Busy, StateId::Ready)?;
            return Ok(None);
        }

        tracing::debug!(
            "Thread {} handling {} {}",
            thread.index(),
            request.method(),
            request.uri()
        );
        let script = request.script_filename().to_path_buf();
        self.request = Some(request);
        Ok(Some(script))
    }

    pub(crate) fn after_execution(&mut self, thread: &PhpThread, exit_status: i32) -> PoolResult<()> {
        if let Some(request) = self.request.take() {
            request.set_exit_status(exit_status);
            request.close();
        }
        thread
            .state()
            .compare_and_swap(StateId::Busy, StateId::Ready)?;
        Ok(())
    }

    pub(crate) fn request_context(&self) -> Option<Arc<RequestContext>> {
        self.request.clone()
    }
}

/// Pin the strings the engine reads as C strings for the whole script run.
fn prepare(arena: &mut PinArena, request: &RequestContext) -> Result<(), NulError> {
    arena.pin_c_string(&request.script_filename().to_string_lossy())?;
    arena.pin_c_string(request.method())?;
    arena.pin_c_string(request.uri())?;
    Ok(())
}
