use std::sync::Arc;

use crossbeam_channel::select;

use crate::arena::PinArena;
use crate::backoff::ExponentialBackoff;
use crate::error::{PoolError, PoolResult};
use crate::handler::Step;
use crate::pool::PoolInner;
use crate::request::{RequestContext, STATUS_BAD_REQUEST, STATUS_INTERNAL_SERVER_ERROR};
use crate::state::StateId;
use crate::thread::PhpThread;
use crate::worker::Worker;

/// Keeps a worker script resident and feeds it requests through
/// `wait_for_worker_request`.
pub(crate) struct WorkerHandler {
    worker: Arc<Worker>,
    backoff: ExponentialBackoff,
    warm_up: Option<Arc<RequestContext>>,
    request: Option<Arc<RequestContext>>,
    // true until the current boot of the script reaches its request loop
    is_booting_script: bool,
}

impl WorkerHandler {
    pub(crate) fn new(worker: Arc<Worker>) -> Self {
        let backoff = ExponentialBackoff::new(
            worker.min_backoff(),
            worker.max_backoff(),
            worker.max_consecutive_failures(),
        );
        Self {
            worker,
            backoff,
            warm_up: None,
            request: None,
            is_booting_script: false,
        }
    }

    pub(crate) fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub(crate) fn before_execution(&mut self, thread: &PhpThread) -> PoolResult<Step> {
        let state = thread.state();
        loop {
            match state.get() {
                StateId::TransitionRequested => {
                    self.worker.detach_thread(thread);
                    return Ok(Step::Swap);
                }
                StateId::Restarting => {
                    state.set(StateId::Yielding)?;
                    state.wait_for(&[StateId::Ready, StateId::ShuttingDown, StateId::Done]);
                }
                current @ (StateId::Ready | StateId::TransitionComplete) => {
                    // a restart or shutdown closes the drain and ends the backoff early
                    let waited = self.backoff.wait(&thread.drain_signal());
                    if !waited || !state.is(current) {
                        continue;
                    }
                    self.setup_worker_script(thread);
                    return Ok(Step::Run(self.worker.file_name().to_path_buf()));
                }
                StateId::ShuttingDown | StateId::Done => {
                    self.worker.detach_thread(thread);
                    return Ok(Step::Stop);
                }
                other => {
                    return Err(PoolError::UnexpectedState {
                        handler: "worker",
                        state: other,
                    });
                }
            }
        }
    }

    fn setup_worker_script(&mut self, thread: &PhpThread) {
        self.warm_up = Some(RequestContext::dummy(
            self.worker.file_name(),
            self.worker.env(),
        ));
        self.is_booting_script = true;

        tracing::debug!(
            worker = %self.worker.name(),
            thread = thread.index(),
            "starting worker script"
        );
    }

    pub(crate) fn after_execution(
        &mut self,
        pool: &PoolInner,
        thread: &PhpThread,
        exit_status: i32,
    ) -> PoolResult<()> {
        self.warm_up = None;

        // a request still bound here means the script died while serving it
        if let Some(request) = self.request.take() {
            request.set_exit_status(exit_status);
            if request.has_written() {
                request.close();
            } else {
                request.reject(STATUS_INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
            thread
                .state()
                .compare_and_swap(StateId::Busy, StateId::Ready)?;
        }

        if exit_status == 0 && !self.is_booting_script {
            self.backoff.record_success();
            tracing::debug!(
                worker = %self.worker.name(),
                thread = thread.index(),
                "restarting worker script"
            );
            return Ok(());
        }

        if self.is_booting_script {
            tracing::error!(
                worker = %self.worker.name(),
                thread = thread.index(),
                exit_status,
                "worker script has not reached its request loop"
            );
        } else {
            tracing::warn!(
                worker = %self.worker.name(),
                thread = thread.index(),
                exit_status,
                "worker script crashed"
            );
        }

        if self.backoff.record_failure() {
            let failures = self.backoff.failure_count();
            if !pool.watcher_enabled() {
                tracing::error!(
                    worker = %self.worker.name(),
                    thread = thread.index(),
                    failures,
                    "too many consecutive worker failures"
                );
                return Err(PoolError::TooManyFailures {
                    worker: self.worker.name().to_string(),
                    failures,
                });
            }
            tracing::warn!(
                worker = %self.worker.name(),
                thread = thread.index(),
                failures,
                "many consecutive worker failures, waiting for a file change"
            );
        }
        Ok(())
    }

    pub(crate) fn wait_for_worker_request(
        &mut self,
        pool: &PoolInner,
        thread: &PhpThread,
        arena: &mut PinArena,
    ) -> PoolResult<bool> {
        let state = thread.state();

        loop {
            // nothing pinned for the previous request may outlive it
            arena.clear();

            if self.is_booting_script {
                self.is_booting_script = false;
                self.warm_up = None;
            }

            // only true the first time the script reaches its loop after a handler change
            state.compare_and_swap(StateId::TransitionComplete, StateId::Ready)?;

            state.mark_as_waiting(true);
            let drain = thread.drain_signal();
            let request = select! {
                recv(drain) -> _ => None,
                recv(thread.requests()) -> request => request.ok(),
                recv(self.worker.requests()) -> request => request.ok(),
            };
            state.mark_as_waiting(false);

            let Some(request) = request else {
                tracing::debug!(
                    worker = %self.worker.name(),
                    thread = thread.index(),
                    "worker request loop interrupted"
                );
                if state.is(StateId::Restarting) && pool.take_cache_flush() {
                    pool.engine().reset_cache();
                }
                return Ok(false);
            };

            state.compare_and_swap(StateId::Ready, StateId::Busy)?;
            if let Err(err) = arena.pin_c_string(request.uri()) {
                request.reject(STATUS_BAD_REQUEST, &format!("Invalid request: {err}"));
                state.compare_and_swap(StateId::Busy, StateId::Ready)?;
                continue;
            }

            tracing::debug!(
                worker = %self.worker.name(),
                thread = thread.index(),
                uri = request.uri(),
                "request handling started"
            );
            self.request = Some(request);
            return Ok(true);
        }
    }

    pub(crate) fn finish_worker_request(&mut self, thread: &PhpThread) -> PoolResult<()> {
        if let Some(request) = self.request.take() {
            request.set_exit_status(0);
            request.close();
            tracing::debug!(
                worker = %self.worker.name(),
                thread = thread.index(),
                uri = request.uri(),
                "request handling finished"
            );
        }
        thread
            .state()
            .compare_and_swap(StateId::Busy, StateId::Ready)?;
        self.backoff.record_success();
        Ok(())
    }

    pub(crate) fn request_context(&self) -> Option<Arc<RequestContext>> {
        self.request.clone().or_else(|| self.warm_up.clone())
    }
}
