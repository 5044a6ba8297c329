//! Autoscaling: add threads while requests stall, remove them once idle.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::{Mutex, MutexGuard};

use crate::config::{PoolConfig, ScalingConfig};
use crate::error::PoolResult;
use crate::pool::PoolInner;
use crate::request::RequestContext;
use crate::state::StateId;
use crate::thread::PhpThread;

pub(crate) struct Scaling {
    enabled: bool,
    max_autoscaled: usize,
    config: ScalingConfig,

    // stalled requests offer themselves here
    signal_tx: Sender<Arc<RequestContext>>,
    signal_rx: Receiver<Arc<RequestContext>>,

    // the allocation lock: every change to a thread's role goes through it
    autoscaled: Mutex<Vec<Arc<PhpThread>>>,

    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Scaling {
    pub(crate) fn new(config: &PoolConfig, max_threads: usize) -> Self {
        let (signal_tx, signal_rx) = crossbeam_channel::bounded(0);
        let max_autoscaled = max_threads.saturating_sub(config.num_threads);
        Self {
            enabled: max_autoscaled > 0,
            max_autoscaled,
            config: config.scaling.clone(),
            signal_tx,
            signal_rx,
            autoscaled: Mutex::new(Vec::with_capacity(max_autoscaled)),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn signal(&self) -> &Sender<Arc<RequestContext>> {
        &self.signal_tx
    }

    pub(crate) fn lock_alloc(&self) -> MutexGuard<'_, Vec<Arc<PhpThread>>> {
        self.autoscaled.lock()
    }

    pub(crate) fn start(&self, pool: &Arc<PoolInner>) {
        let mut loops = self.loops.lock();

        let upscaler = Arc::clone(pool);
        match thread::Builder::new()
            .name("php-upscaler".to_string())
            .spawn(move || upscale_loop(&upscaler))
        {
            Ok(handle) => loops.push(handle),
            Err(err) => tracing::warn!("Unable to start upscaling: {}", err),
        }

        let downscaler = Arc::clone(pool);
        match thread::Builder::new()
            .name("php-downscaler".to_string())
            .spawn(move || downscale_loop(&downscaler))
        {
            Ok(handle) => loops.push(handle),
            Err(err) => tracing::warn!("Unable to start downscaling: {}", err),
        }

        tracing::debug!(
            "Autoscaling enabled: up to {} additional threads",
            self.max_autoscaled
        );
    }

    /// Wait for the scaling loops; the pool's done signal must be closed first.
    pub(crate) fn stop(&self) {
        let loops: Vec<_> = self.loops.lock().drain(..).collect();
        for handle in loops {
            if handle.join().is_err() {
                tracing::warn!("Autoscaling loop panicked");
            }
        }
    }
}

fn upscale_loop(pool: &Arc<PoolInner>) {
    let scaling = &pool.scaling;
    let done = pool.done_signal();
    let min_stall_time = scaling.config.min_stall_time();

    loop {
        if scaling.lock_alloc().len() >= scaling.max_autoscaled {
            // at max_threads, check again later
            select! {
                recv(done) -> _ => return,
                recv(crossbeam_channel::after(scaling.config.downscale_check_interval())) -> _ => continue,
            }
        }

        select! {
            recv(scaling.signal_rx) -> request => {
                let Ok(request) = request else { return };

                // requests must have stalled for a while before they may scale
                let stalled = request.elapsed();
                if stalled < min_stall_time {
                    select! {
                        recv(done) -> _ => return,
                        recv(crossbeam_channel::after(min_stall_time - stalled)) -> _ => continue,
                    }
                }

                match pool.workers().get(request.script_filename()) {
                    Some(worker) => pool.scale_up(|pool| pool.add_worker_thread_locked(&worker)),
                    None => pool.scale_up(|pool| pool.add_regular_thread_locked()),
                }
            }
            recv(done) -> _ => return,
        }
    }
}

fn downscale_loop(pool: &Arc<PoolInner>) {
    let interval = pool.scaling.config.downscale_check_interval();
    loop {
        select! {
            recv(pool.done_signal()) -> _ => return,
            recv(crossbeam_channel::after(interval)) -> _ => {
                if let Err(err) = pool.downscale_sweep() {
                    pool.report_fatal(&err);
                }
            }
        }
    }
}

impl PoolInner {
    fn scale_up<F>(self: &Arc<Self>, add: F)
    where
        F: FnOnce(&Arc<Self>) -> PoolResult<Arc<PhpThread>>,
    {
        let mut autoscaled = self.scaling.lock_alloc();
        if self.is_shutting_down() || autoscaled.len() >= self.scaling.max_autoscaled {
            return;
        }

        match add(self) {
            Ok(thread) => {
                tracing::info!("Autoscaled thread {} ({})", thread.index(), thread.name());
                autoscaled.push(thread);
            }
            Err(err) if err.is_fatal() => self.report_fatal(&err),
            Err(err) => {
                tracing::warn!(
                    "Could not add a thread, consider raising max_threads: {}",
                    err
                );
            }
        }
    }

    /// One downscale pass. Idle autoscaled threads first become inactive; an
    /// inactive thread that stays idle is then retired to a reserved slot.
    pub(crate) fn downscale_sweep(&self) -> PoolResult<usize> {
        let config = &self.scaling.config;
        let max_idle_time = config.max_idle_time();
        let mut autoscaled = self.scaling.lock_alloc();
        let mut stopped = 0;

        // threads stopped or converted by other means no longer count as autoscaled
        autoscaled.retain(|thread| {
            !matches!(
                thread.state().get(),
                StateId::Reserved
                    | StateId::Inactive
                    | StateId::Draining
                    | StateId::ShuttingDown
                    | StateId::Done
            )
        });

        let mut index = autoscaled.len();
        while index > 0 && stopped < config.max_termination_count {
            index -= 1;
            let thread = Arc::clone(&autoscaled[index]);
            if !thread.state().is(StateId::Ready) || !idle_for(&thread, max_idle_time) {
                continue;
            }
            if !self.may_deactivate(&thread) {
                continue;
            }

            tracing::debug!("Auto-converting thread {} to inactive", thread.index());
            if self.convert_to_inactive(&thread)? {
                autoscaled.remove(index);
                stopped += 1;
            }
        }

        for thread in self.threads() {
            if stopped >= config.max_termination_count {
                break;
            }
            if !thread.state().is(StateId::Inactive) || !idle_for(thread, max_idle_time) {
                continue;
            }
            tracing::debug!("Auto-stopping idle thread {}", thread.index());
            if thread.retire()? {
                stopped += 1;
            }
        }

        Ok(stopped)
    }

    /// The regular pool keeps at least one thread and a worker keeps its
    /// configured number of threads.
    fn may_deactivate(&self, thread: &Arc<PhpThread>) -> bool {
        for worker in self.workers().all() {
            if worker
                .threads()
                .iter()
                .any(|attached| attached.index() == thread.index())
            {
                return worker.count_threads() > worker.num_threads();
            }
        }
        self.regular().count() > 1
    }
}

fn idle_for(thread: &PhpThread, max_idle_time: Duration) -> bool {
    thread.state().is_waiting() && thread.state().wait_time() > max_idle_time
}
