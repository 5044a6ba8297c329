use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pool::{DebugState, PoolConfig, PoolError, RequestContext, Response, ScriptEngine, ThreadPool};
use thiserror::Error;
use tokio::sync::Mutex;
use watcher::{FileWatcher, WatchEntry, WatchError, WatchPattern};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// The pool error behind this one, if any.
    pub fn pool_error(&self) -> Option<&PoolError> {
        match self {
            EngineError::Pool(err) => Some(err),
            _ => None,
        }
    }
}

/// The thread pool plus the file watcher restarting its workers.
///
/// The pool blocks, so everything here runs on tokio's blocking pool.
pub struct RuntimeEngine {
    pool: Arc<ThreadPool>,
    watcher: Mutex<Option<FileWatcher>>,
}

impl RuntimeEngine {
    /// Boot the pool, then watch the files of workers that have watch patterns.
    pub async fn start(
        config: PoolConfig,
        script_engine: Arc<dyn ScriptEngine>,
    ) -> Result<Self, EngineError> {
        Self::start_with_debounce(config, script_engine, watcher::DEFAULT_DEBOUNCE).await
    }

    pub async fn start_with_debounce(
        config: PoolConfig,
        script_engine: Arc<dyn ScriptEngine>,
        debounce: Duration,
    ) -> Result<Self, EngineError> {
        let pool =
            tokio::task::spawn_blocking(move || ThreadPool::start(config, script_engine)).await??;
        Self::with_pool(pool, debounce)
    }

    /// Attach a watcher to an already started pool.
    pub fn with_pool(pool: ThreadPool, debounce: Duration) -> Result<Self, EngineError> {
        let pool = Arc::new(pool);
        let entries = watch_entries(&pool)?;

        let watcher = if entries.is_empty() {
            None
        } else {
            tracing::info!("Watching {} patterns for worker restarts", entries.len());
            let restart_pool = Arc::clone(&pool);
            Some(FileWatcher::start(entries, debounce, move |files| {
                restart_changed_workers(&restart_pool, files)
            })?)
        };

        Ok(Self {
            pool,
            watcher: Mutex::new(watcher),
        })
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Serve `request` and return its response. Dropping the future cancels a
    /// request that is still waiting for a thread.
    pub async fn serve(&self, request: Arc<RequestContext>) -> Result<Response, EngineError> {
        let mut guard = CancelOnDrop(Some(Arc::clone(&request)));
        let pool = Arc::clone(&self.pool);
        let served = Arc::clone(&request);
        let result = tokio::task::spawn_blocking(move || pool.serve(&served)).await;
        guard.disarm();

        result??;
        Ok(request.response())
    }

    pub async fn add_regular_thread(&self) -> Result<usize, EngineError> {
        self.blocking(|pool| pool.add_regular_thread()).await
    }

    pub async fn remove_regular_thread(&self) -> Result<usize, EngineError> {
        self.blocking(|pool| pool.remove_regular_thread()).await
    }

    pub async fn add_worker_thread(&self, pattern: &str) -> Result<usize, EngineError> {
        let pattern = pattern.to_string();
        self.blocking(move |pool| pool.add_worker_thread(&pattern)).await
    }

    pub async fn remove_worker_thread(&self, pattern: &str) -> Result<usize, EngineError> {
        let pattern = pattern.to_string();
        self.blocking(move |pool| pool.remove_worker_thread(&pattern)).await
    }

    pub async fn restart_workers(&self) -> Result<usize, EngineError> {
        self.blocking(|pool| pool.restart_workers()).await
    }

    pub fn debug_state(&self) -> DebugState {
        self.pool.debug_state()
    }

    /// Stop the watcher first so no restart races the pool shutdown.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        if let Some(mut watcher) = self.watcher.lock().await.take() {
            watcher.stop().await;
        }
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || pool.shutdown()).await?;
        Ok(())
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnOnce(&ThreadPool) -> Result<T, PoolError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        Ok(tokio::task::spawn_blocking(move || op(&pool)).await??)
    }
}

struct CancelOnDrop(Option<Arc<RequestContext>>);

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(request) = self.0.take() {
            request.cancel();
        }
    }
}

fn watch_entries(pool: &ThreadPool) -> Result<Vec<WatchEntry>, WatchError> {
    let mut entries = Vec::new();
    for worker in pool.workers() {
        for pattern in worker.watch() {
            let pattern = WatchPattern::parse(pattern)?;
            entries.push(WatchEntry::new(pattern, worker.file_name()));
        }
    }
    Ok(entries)
}

fn restart_changed_workers(pool: &ThreadPool, files: &[PathBuf]) {
    match pool.restart_workers_by_file(files) {
        Ok(restarted) => {
            tracing::info!("Restarted {} worker threads after file changes", restarted)
        }
        Err(err) => tracing::error!("Failed to restart workers after file changes: {}", err),
    }
}
