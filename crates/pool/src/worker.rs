//! Worker scripts and the threads attached to them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::config::WorkerConfig;
use crate::error::{PoolError, PoolResult};
use crate::request::RequestContext;
use crate::script::WORKER_MODE_ENV;
use crate::thread::PhpThread;

/// A resident worker script. Identified by its absolute path.
pub struct Worker {
    name: String,
    file_name: PathBuf,
    num_threads: usize,
    env: HashMap<String, String>,
    watch: Vec<String>,
    max_consecutive_failures: Option<u32>,
    min_backoff: Duration,
    max_backoff: Duration,

    // requests any thread of this worker may take
    request_tx: Sender<Arc<RequestContext>>,
    request_rx: Receiver<Arc<RequestContext>>,

    threads: RwLock<Vec<Arc<PhpThread>>>,
}

impl Worker {
    fn new(config: &WorkerConfig) -> PoolResult<Self> {
        let file_name = absolute_path(&config.file_name)?;
        let mut env = config.env.clone();
        env.insert(WORKER_MODE_ENV.to_string(), "1".to_string());
        let (request_tx, request_rx) = crossbeam_channel::bounded(0);

        Ok(Self {
            name: config
                .name
                .clone()
                .unwrap_or_else(|| file_name.to_string_lossy().into_owned()),
            file_name,
            num_threads: config.num_threads,
            env,
            watch: config.watch.clone(),
            max_consecutive_failures: config.max_failures(),
            min_backoff: Duration::from_millis(config.min_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            request_tx,
            request_rx,
            threads: RwLock::new(Vec::with_capacity(config.num_threads)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    /// Configured thread count; the autoscaler never goes below it.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn watch(&self) -> &[String] {
        &self.watch
    }

    pub fn max_consecutive_failures(&self) -> Option<u32> {
        self.max_consecutive_failures
    }

    /// First delay before rebooting a crashed script.
    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub(crate) fn requests(&self) -> &Receiver<Arc<RequestContext>> {
        &self.request_rx
    }

    pub(crate) fn queue(&self) -> &Sender<Arc<RequestContext>> {
        &self.request_tx
    }

    pub(crate) fn attach_thread(&self, thread: &Arc<PhpThread>) {
        self.threads.write().push(Arc::clone(thread));
    }

    pub(crate) fn detach_thread(&self, thread: &PhpThread) {
        self.threads
            .write()
            .retain(|attached| attached.index() != thread.index());
    }

    pub fn count_threads(&self) -> usize {
        self.threads.read().len()
    }

    pub fn threads(&self) -> Vec<Arc<PhpThread>> {
        self.threads.read().clone()
    }

    pub(crate) fn last_thread(&self) -> Option<Arc<PhpThread>> {
        self.threads.read().last().cloned()
    }

    /// Hand `request` to the first attached thread that is waiting for one.
    pub(crate) fn try_handoff(&self, request: &Arc<RequestContext>) -> bool {
        self.threads
            .read()
            .iter()
            .any(|thread| thread.try_handoff(request))
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("file_name", &self.file_name)
            .field("num_threads", &self.num_threads)
            .field("attached", &self.count_threads())
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct WorkerRegistry {
    // registration order; the first worker answers the empty pattern
    workers: RwLock<Vec<Arc<Worker>>>,
    // one restart episode at a time
    restart_mu: Mutex<()>,
}

impl WorkerRegistry {
    pub(crate) fn register(&self, config: &WorkerConfig) -> PoolResult<Arc<Worker>> {
        let worker = Arc::new(Worker::new(config)?);
        let mut workers = self.workers.write();
        if workers
            .iter()
            .any(|existing| existing.file_name == worker.file_name)
        {
            return Err(PoolError::DuplicateWorker(worker.file_name.clone()));
        }
        workers.push(Arc::clone(&worker));
        Ok(worker)
    }

    pub(crate) fn get(&self, file_name: &Path) -> Option<Arc<Worker>> {
        let workers = self.workers.read();
        if workers.is_empty() {
            return None;
        }
        let file_name = absolute_path(file_name).ok()?;
        workers
            .iter()
            .find(|worker| worker.file_name == file_name)
            .cloned()
    }

    /// The first worker whose path ends with `pattern` or whose name is
    /// `pattern`. An empty pattern matches the first worker.
    pub(crate) fn find(&self, pattern: &str) -> Option<Arc<Worker>> {
        self.workers
            .read()
            .iter()
            .find(|worker| {
                pattern.is_empty()
                    || worker.name == pattern
                    || worker.file_name.to_string_lossy().ends_with(pattern)
            })
            .cloned()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Worker>> {
        self.workers.read().clone()
    }

    pub(crate) fn lock_restart(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.restart_mu.lock()
    }
}

fn absolute_path(path: &Path) -> PoolResult<PathBuf> {
    std::path::absolute(path).map_err(|err| {
        PoolError::InvalidConfig(format!(
            "worker filename is invalid {}: {}",
            path.display(),
            err
        ))
    })
}
