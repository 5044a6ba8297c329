//! The thread pool: fixed thread slots, the regular pool, the worker registry
//! and the administrative operations on top of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::config::PoolConfig;
use crate::debug::{DebugState, ThreadDebugState};
use crate::error::{PoolError, PoolResult};
use crate::handler::Handler;
use crate::request::RequestContext;
use crate::scaling::Scaling;
use crate::script::ScriptEngine;
use crate::state::StateId;
use crate::thread::PhpThread;
use crate::worker::{Worker, WorkerRegistry};

/// Receives fatal errors raised on pool threads.
pub type FatalHandler = Arc<dyn Fn(&PoolError) + Send + Sync>;

/// Log and exit: a fatal error leaves the pool in an unknown state.
pub fn exit_on_fatal() -> FatalHandler {
    Arc::new(|err: &PoolError| {
        tracing::error!("Fatal thread pool error: {}", err);
        std::process::exit(1);
    })
}

// ========== Regular Pool ==========

/// Threads running the regular handler, all fed from one shared queue.
pub(crate) struct RegularPool {
    request_tx: Sender<Arc<RequestContext>>,
    request_rx: Receiver<Arc<RequestContext>>,
    threads: RwLock<Vec<Arc<PhpThread>>>,
}

impl RegularPool {
    fn new() -> Self {
        let (request_tx, request_rx) = crossbeam_channel::bounded(0);
        Self {
            request_tx,
            request_rx,
            threads: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> &Receiver<Arc<RequestContext>> {
        &self.request_rx
    }

    pub(crate) fn queue(&self) -> &Sender<Arc<RequestContext>> {
        &self.request_tx
    }

    pub(crate) fn attach(&self, thread: &Arc<PhpThread>) {
        self.threads.write().push(Arc::clone(thread));
    }

    pub(crate) fn detach(&self, thread: &PhpThread) {
        self.threads
            .write()
            .retain(|attached| attached.index() != thread.index());
    }

    pub(crate) fn count(&self) -> usize {
        self.threads.read().len()
    }

    fn last(&self) -> Option<Arc<PhpThread>> {
        self.threads.read().last().cloned()
    }
}

// ========== Shared Pool State ==========

pub(crate) struct PoolInner {
    config: PoolConfig,
    engine: Arc<dyn ScriptEngine>,
    threads: Vec<Arc<PhpThread>>,
    regular: RegularPool,
    workers: WorkerRegistry,
    pub(crate) scaling: Scaling,
    core_ids: Option<Vec<core_affinity::CoreId>>,

    watcher_enabled: AtomicBool,
    // set when a restart episode starts, taken by the thread that flushes
    cache_flush_pending: AtomicBool,
    shutting_down: AtomicBool,
    queued_requests: AtomicU64,

    // closed on shutdown
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,

    fatal: FatalHandler,
}

impl PoolInner {
    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn engine(&self) -> &Arc<dyn ScriptEngine> {
        &self.engine
    }

    pub(crate) fn threads(&self) -> &[Arc<PhpThread>] {
        &self.threads
    }

    pub(crate) fn regular(&self) -> &RegularPool {
        &self.regular
    }

    pub(crate) fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub(crate) fn watcher_enabled(&self) -> bool {
        self.watcher_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn done_signal(&self) -> &Receiver<()> {
        &self.done_rx
    }

    pub(crate) fn record_queued(&self) {
        self.queued_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// True for exactly one caller per restart episode.
    pub(crate) fn take_cache_flush(&self) -> bool {
        self.cache_flush_pending.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn core_for(&self, index: usize) -> Option<core_affinity::CoreId> {
        if !self.config.pin_threads {
            return None;
        }
        self.core_ids
            .as_ref()
            .filter(|ids| !ids.is_empty())
            .and_then(|ids| ids.get(index % ids.len()).copied())
    }

    pub(crate) fn report_fatal(&self, err: &PoolError) {
        tracing::error!("Fatal error on pool thread: {}", err);
        (self.fatal)(err);
    }

    /// Forward fatal errors to the fatal handler, then hand the result back.
    pub(crate) fn check_fatal<T>(&self, result: PoolResult<T>) -> PoolResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.report_fatal(err);
            }
        }
        result
    }

    // ========== Thread Allocation ==========

    /// An inactive thread, or a freshly booted reserved slot.
    pub(crate) fn free_thread(self: &Arc<Self>) -> PoolResult<Arc<PhpThread>> {
        if let Some(thread) = self
            .threads
            .iter()
            .find(|thread| thread.state().is(StateId::Inactive))
        {
            return Ok(Arc::clone(thread));
        }

        for thread in &self.threads {
            if thread.state().is(StateId::Reserved) {
                thread.boot(self)?;
                if thread.state().is(StateId::Inactive) {
                    return Ok(Arc::clone(thread));
                }
            }
        }

        Err(PoolError::MaxThreadsReached {
            count: self.threads.len(),
        })
    }

    pub(crate) fn convert_to_regular(&self, thread: &Arc<PhpThread>) -> PoolResult<bool> {
        if !thread.set_handler(Handler::regular())? {
            return Ok(false);
        }
        self.regular.attach(thread);
        Ok(true)
    }

    pub(crate) fn convert_to_worker(
        &self,
        thread: &Arc<PhpThread>,
        worker: &Arc<Worker>,
    ) -> PoolResult<bool> {
        if !thread.set_handler(Handler::worker(Arc::clone(worker)))? {
            return Ok(false);
        }
        worker.attach_thread(thread);
        Ok(true)
    }

    pub(crate) fn convert_to_inactive(&self, thread: &Arc<PhpThread>) -> PoolResult<bool> {
        thread.set_handler(Handler::inactive())
    }

    /// Convert a free thread to a regular thread and wait until it serves.
    /// The caller holds the allocation lock.
    pub(crate) fn add_regular_thread_locked(self: &Arc<Self>) -> PoolResult<Arc<PhpThread>> {
        let thread = self.free_thread()?;
        self.convert_to_regular(&thread)?;
        thread
            .state()
            .wait_for(&[StateId::Ready, StateId::ShuttingDown, StateId::Done]);
        Ok(thread)
    }

    /// Convert a free thread to a thread of `worker`. The caller holds the
    /// allocation lock.
    pub(crate) fn add_worker_thread_locked(
        self: &Arc<Self>,
        worker: &Arc<Worker>,
    ) -> PoolResult<Arc<PhpThread>> {
        let thread = self.free_thread()?;
        self.convert_to_worker(&thread, worker)?;
        Ok(thread)
    }

    // ========== Restart ==========

    /// Restart the threads of `workers` through Restarting -> Yielding -> Ready.
    /// Returns the number of restarted threads.
    pub(crate) fn restart_workers(&self, workers: &[Arc<Worker>]) -> PoolResult<usize> {
        let _episode = self.workers.lock_restart();

        let candidates: Vec<Arc<PhpThread>> =
            workers.iter().flat_map(|worker| worker.threads()).collect();
        // no handler swaps while restarting
        let guards: Vec<_> = candidates.iter().map(|thread| thread.lock_handler()).collect();

        // a swap that finished before we got the lock may have detached a thread
        let attached: Vec<usize> = workers
            .iter()
            .flat_map(|worker| worker.threads())
            .map(|thread| thread.index())
            .collect();

        self.cache_flush_pending.store(true, Ordering::SeqCst);
        let mut restarting = Vec::new();
        for thread in candidates
            .iter()
            .filter(|thread| attached.contains(&thread.index()))
        {
            if thread.state().request_restart()? {
                thread.close_drain();
                restarting.push(thread);
            }
        }

        for thread in &restarting {
            thread
                .state()
                .wait_for(&[StateId::Yielding, StateId::ShuttingDown, StateId::Done]);
        }

        // every thread yielded without flushing, e.g. because none was waiting for a request
        if self.take_cache_flush() && !restarting.is_empty() {
            self.engine.reset_cache();
        }

        for thread in &restarting {
            thread.renew_drain();
            thread
                .state()
                .compare_and_swap(StateId::Yielding, StateId::Ready)?;
        }
        drop(guards);

        tracing::info!(
            "Restarted {} worker threads across {} workers",
            restarting.len(),
            workers.len()
        );
        Ok(restarting.len())
    }
}

// ========== Thread Pool ==========

/// A pool of script threads serving regular and worker requests.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Boot the pool; fatal errors on pool threads exit the process.
    pub fn start(config: PoolConfig, engine: Arc<dyn ScriptEngine>) -> PoolResult<Self> {
        Self::start_with_fatal_handler(config, engine, exit_on_fatal())
    }

    pub fn start_with_fatal_handler(
        config: PoolConfig,
        engine: Arc<dyn ScriptEngine>,
        fatal: FatalHandler,
    ) -> PoolResult<Self> {
        config.validate()?;
        engine.initialize().map_err(PoolError::Engine)?;

        let max_threads = config.resolved_max_threads();
        let threads = (0..max_threads)
            .map(|index| Arc::new(PhpThread::new(index)))
            .collect();
        let (done_tx, done_rx) = crossbeam_channel::bounded(0);
        let watcher_enabled = config.workers.iter().any(|worker| !worker.watch.is_empty());
        let core_ids = if config.pin_threads {
            core_affinity::get_core_ids()
        } else {
            None
        };

        tracing::info!(
            "Initializing thread pool: {} threads, {} max threads, {} workers",
            config.num_threads,
            max_threads,
            config.workers.len()
        );

        let inner = Arc::new(PoolInner {
            scaling: Scaling::new(&config, max_threads),
            config,
            engine,
            threads,
            regular: RegularPool::new(),
            workers: WorkerRegistry::default(),
            core_ids,
            watcher_enabled: AtomicBool::new(watcher_enabled),
            cache_flush_pending: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            queued_requests: AtomicU64::new(0),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            fatal,
        });

        // dropping the pool on error shuts down whatever was booted
        let pool = ThreadPool { inner };
        pool.boot()?;
        Ok(pool)
    }

    fn boot(&self) -> PoolResult<()> {
        let inner = &self.inner;
        let num_threads = inner.config.num_threads;

        thread::scope(|scope| {
            let booting: Vec<_> = inner.threads[..num_threads]
                .iter()
                .map(|thread| scope.spawn(move || thread.boot(inner)))
                .collect();
            booting
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(PoolError::Spawn {
                            index: 0,
                            reason: "boot panicked".to_string(),
                        })
                    })
                })
                .collect::<PoolResult<Vec<()>>>()
        })?;

        let alloc = inner.scaling.lock_alloc();
        for worker_config in &inner.config.workers {
            let worker = inner.workers.register(worker_config)?;
            for _ in 0..worker.num_threads() {
                inner.add_worker_thread_locked(&worker)?;
            }
            tracing::info!(
                "Started worker {} with {} threads",
                worker.name(),
                worker.num_threads()
            );
        }

        let regular_threads = num_threads - inner.config.worker_thread_count();
        for _ in 0..regular_threads {
            inner.add_regular_thread_locked()?;
        }
        drop(alloc);

        if inner.scaling.is_enabled() {
            inner.scaling.start(inner);
        }
        Ok(())
    }

    /// Dispatch `request` to a thread and block until it is done.
    pub fn serve(&self, request: &Arc<RequestContext>) -> PoolResult<()> {
        self.inner.dispatch(request)
    }

    // ========== Admin Operations ==========

    /// Returns the number of regular threads afterwards.
    pub fn add_regular_thread(&self) -> PoolResult<usize> {
        let _alloc = self.inner.scaling.lock_alloc();
        self.ensure_running()?;
        self.inner.add_regular_thread_locked()?;
        Ok(self.inner.regular.count())
    }

    pub fn remove_regular_thread(&self) -> PoolResult<usize> {
        let _alloc = self.inner.scaling.lock_alloc();
        self.ensure_running()?;
        let count = self.inner.regular.count();
        let thread = match self.inner.regular.last() {
            Some(thread) if count > 1 => thread,
            _ => return Err(PoolError::CannotRemoveLastThread { count }),
        };
        self.inner.convert_to_inactive(&thread)?;
        Ok(self.inner.regular.count())
    }

    /// Returns the number of threads of the matching worker afterwards.
    pub fn add_worker_thread(&self, pattern: &str) -> PoolResult<usize> {
        let worker = self.find_worker(pattern)?;
        let _alloc = self.inner.scaling.lock_alloc();
        self.ensure_running()?;
        self.inner.add_worker_thread_locked(&worker)?;
        Ok(worker.count_threads())
    }

    pub fn remove_worker_thread(&self, pattern: &str) -> PoolResult<usize> {
        let worker = self.find_worker(pattern)?;
        let _alloc = self.inner.scaling.lock_alloc();
        self.ensure_running()?;
        let count = worker.count_threads();
        let thread = match worker.last_thread() {
            Some(thread) if count > 1 => thread,
            _ => return Err(PoolError::CannotRemoveLastThread { count }),
        };
        self.inner.convert_to_inactive(&thread)?;
        Ok(worker.count_threads())
    }

    /// Gracefully restart every worker; one engine cache flush for all of them.
    pub fn restart_workers(&self) -> PoolResult<usize> {
        let workers = self.inner.workers.all();
        self.inner.restart_workers(&workers)
    }

    /// Restart only the workers whose script is one of `file_names`.
    pub fn restart_workers_by_file(&self, file_names: &[std::path::PathBuf]) -> PoolResult<usize> {
        let workers: Vec<_> = self
            .inner
            .workers
            .all()
            .into_iter()
            .filter(|worker| file_names.iter().any(|file| worker.file_name() == file))
            .collect();
        if workers.is_empty() {
            return Ok(0);
        }
        self.inner.restart_workers(&workers)
    }

    pub fn debug_state(&self) -> DebugState {
        let mut state = DebugState::default();
        for thread in &self.inner.threads {
            if thread.state().is(StateId::Reserved) {
                state.reserved_thread_count += 1;
                continue;
            }
            state.thread_debug_states.push(ThreadDebugState::of(thread));
        }
        state
    }

    // ========== Introspection ==========

    pub fn worker(&self, pattern: &str) -> Option<Arc<Worker>> {
        self.inner.workers.find(pattern)
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.inner.workers.all()
    }

    pub fn regular_thread_count(&self) -> usize {
        self.inner.regular.count()
    }

    pub fn max_threads(&self) -> usize {
        self.inner.threads.len()
    }

    /// Requests that found no free thread right away.
    pub fn queued_requests(&self) -> u64 {
        self.inner.queued_requests.load(Ordering::Relaxed)
    }

    pub fn autoscaled_thread_count(&self) -> usize {
        self.inner.scaling.lock_alloc().len()
    }

    pub fn watcher_enabled(&self) -> bool {
        self.inner.watcher_enabled()
    }

    /// Crash-looping workers only escalate to a fatal error without a watcher.
    pub fn set_watcher_enabled(&self, enabled: bool) {
        self.inner.watcher_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Run one downscale sweep now; returns the number of threads stopped.
    pub fn downscale_idle_threads(&self) -> PoolResult<usize> {
        self.inner.downscale_sweep()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Stop scaling, then stop every thread and wait for all of them.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down thread pool");

        inner.done_tx.lock().take();
        inner.scaling.stop();

        for thread in &inner.threads {
            if let Ok(true) = thread
                .state()
                .compare_and_swap(StateId::Reserved, StateId::ShuttingDown)
            {
                let _ = thread.state().set(StateId::Done);
            }
        }

        thread::scope(|scope| {
            for thread in &inner.threads {
                scope.spawn(move || {
                    if let Err(err) = thread.shutdown() {
                        tracing::warn!("Thread {} did not shut down cleanly: {}", thread.index(), err);
                    }
                });
            }
        });
        tracing::info!("Thread pool stopped");
    }

    fn find_worker(&self, pattern: &str) -> PoolResult<Arc<Worker>> {
        self.inner
            .workers
            .find(pattern)
            .ok_or_else(|| PoolError::WorkerNotFound(pattern.to_string()))
    }

    fn ensure_running(&self) -> PoolResult<()> {
        if self.inner.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }
        Ok(())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
