//! Pool threads: one OS thread per booted slot, driven by its handler.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::arena::PinArena;
use crate::error::{PoolError, PoolResult};
use crate::handler::Handler;
use crate::pool::PoolInner;
use crate::request::RequestContext;
use crate::script::{CRASH_EXIT_STATUS, ScriptContext};
use crate::state::{StateId, ThreadState};

/// Closed to interrupt whatever a thread is blocked on; renewed afterwards.
struct DrainSignal {
    tx: Option<Sender<()>>,
    rx: Receiver<()>,
}

impl DrainSignal {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self { tx: Some(tx), rx }
    }
}

pub struct PhpThread {
    index: usize,
    state: ThreadState,

    // requests handed to this thread specifically
    request_tx: Sender<Arc<RequestContext>>,
    request_rx: Receiver<Arc<RequestContext>>,

    drain: Mutex<DrainSignal>,

    // held for the duration of a handler swap or a worker restart
    handler_mu: Mutex<()>,
    pending_handler: Mutex<Option<Handler>>,
    handler_name: Mutex<String>,

    join: Mutex<Option<JoinHandle<()>>>,
}

impl PhpThread {
    pub(crate) fn new(index: usize) -> Self {
        let (request_tx, request_rx) = crossbeam_channel::bounded(0);
        Self {
            index,
            state: ThreadState::new(),
            request_tx,
            request_rx,
            drain: Mutex::new(DrainSignal::new()),
            handler_mu: Mutex::new(()),
            pending_handler: Mutex::new(None),
            handler_name: Mutex::new(Handler::inactive().name()),
            join: Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> &ThreadState {
        &self.state
    }

    pub fn name(&self) -> String {
        self.handler_name.lock().clone()
    }

    pub(crate) fn requests(&self) -> &Receiver<Arc<RequestContext>> {
        &self.request_rx
    }

    /// Hand `request` to this thread if it is blocked waiting for one.
    pub(crate) fn try_handoff(&self, request: &Arc<RequestContext>) -> bool {
        match self.request_tx.try_send(Arc::clone(request)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub(crate) fn drain_signal(&self) -> Receiver<()> {
        self.drain.lock().rx.clone()
    }

    pub(crate) fn close_drain(&self) {
        self.drain.lock().tx.take();
    }

    pub(crate) fn renew_drain(&self) {
        *self.drain.lock() = DrainSignal::new();
    }

    pub(crate) fn lock_handler(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.handler_mu.lock()
    }

    /// Spawn the OS thread for a reserved slot and wait until it is inactive.
    pub(crate) fn boot(self: &Arc<Self>, pool: &Arc<PoolInner>) -> PoolResult<()> {
        if !self
            .state
            .compare_and_swap(StateId::Reserved, StateId::Booting)?
        {
            return Err(PoolError::UnexpectedState {
                handler: "boot",
                state: self.state.get(),
            });
        }

        {
            let _guard = self.handler_mu.lock();
            *self.handler_name.lock() = Handler::inactive().name();
            self.renew_drain();
        }

        let core_id = pool.core_for(self.index);
        let thread_pool = Arc::clone(pool);
        let php_thread = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("php-thread-{}", self.index))
            .spawn(move || {
                if let Some(core_id) = core_id {
                    core_affinity::set_for_current(core_id);
                }
                run(thread_pool, php_thread);
            });

        match spawned {
            Ok(handle) => *self.join.lock() = Some(handle),
            Err(err) => {
                tracing::error!("Unable to spawn thread {}: {}", self.index, err);
                self.state.set(StateId::ShuttingDown)?;
                self.state.set(StateId::Done)?;
                self.state.set(StateId::Reserved)?;
                return Err(PoolError::Spawn {
                    index: self.index,
                    reason: err.to_string(),
                });
            }
        }

        self.state
            .wait_for(&[StateId::Inactive, StateId::ShuttingDown, StateId::Done]);
        Ok(())
    }

    /// Stop the thread and wait for its OS thread to exit.
    pub(crate) fn shutdown(&self) -> PoolResult<()> {
        if self.state.request_safe_state_change(StateId::ShuttingDown)? {
            self.close_drain();
        }
        // already stopping: wait for whoever stops it
        self.state.wait_for(&[StateId::Done, StateId::Reserved]);
        self.join_os_thread();
        self.renew_drain();
        Ok(())
    }

    /// Shut down an inactive thread and return its slot to `Reserved`.
    pub(crate) fn retire(&self) -> PoolResult<bool> {
        if !self
            .state
            .compare_and_swap(StateId::Inactive, StateId::Draining)?
        {
            return Ok(false);
        }
        self.state.wait_for(&[StateId::Done]);
        self.join_os_thread();
        self.renew_drain();
        self.state.compare_and_swap(StateId::Done, StateId::Reserved)?;
        Ok(true)
    }

    fn join_os_thread(&self) {
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("Thread {} panicked while stopping", self.index);
            }
        }
    }

    /// Swap the handler from outside the thread. Returns false when the thread
    /// is stopping and the handler was not installed.
    pub(crate) fn set_handler(&self, handler: Handler) -> PoolResult<bool> {
        let _guard = self.handler_mu.lock();
        if !self
            .state
            .request_safe_state_change(StateId::TransitionRequested)?
        {
            return Ok(false);
        }

        let name = handler.name();
        *self.pending_handler.lock() = Some(handler);
        self.close_drain();
        self.state
            .wait_for(&[StateId::TransitionInProgress, StateId::Done]);
        self.renew_drain();
        *self.handler_name.lock() = name;
        self.state.set(StateId::TransitionComplete)?;
        Ok(true)
    }

    /// The thread side of `set_handler`.
    pub(crate) fn transition_to_new_handler(&self) -> PoolResult<Handler> {
        self.state.set(StateId::TransitionInProgress)?;
        self.state.wait_for(&[StateId::TransitionComplete]);
        self.pending_handler
            .lock()
            .take()
            .ok_or(PoolError::UnexpectedState {
                handler: "handler transition",
                state: self.state.get(),
            })
    }
}

fn run(pool: Arc<PoolInner>, thread: Arc<PhpThread>) {
    tracing::debug!("Thread {} started", thread.index);
    pool.engine().thread_started(thread.index);

    let mut handler = Handler::inactive();
    let mut arena = PinArena::new();
    let result = run_scripts(&pool, &thread, &mut handler, &mut arena);

    arena.clear();
    pool.engine().thread_stopped(thread.index);

    let result = result.and_then(|()| thread.state.set(StateId::Done));
    if let Err(err) = result {
        handler.detach(&pool, &thread);
        pool.report_fatal(&err);
        thread.state.abandon();
    }
    tracing::debug!("Thread {} stopped", thread.index);
}

fn run_scripts(
    pool: &PoolInner,
    thread: &PhpThread,
    handler: &mut Handler,
    arena: &mut PinArena,
) -> PoolResult<()> {
    while let Some(script) = handler.before_execution(pool, thread, arena)? {
        let exit_status = {
            let mut ctx = ScriptContext::new(pool, thread, handler, arena);
            let engine = pool.engine();
            panic::catch_unwind(AssertUnwindSafe(|| engine.run_script(&mut ctx, &script)))
                .unwrap_or_else(|_| {
                    tracing::error!(
                        "Script {} panicked on thread {}",
                        script.display(),
                        thread.index
                    );
                    CRASH_EXIT_STATUS
                })
        };

        handler.after_execution(pool, thread, exit_status)?;
        arena.clear();
    }
    Ok(())
}
