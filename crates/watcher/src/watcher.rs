use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use crate::error::WatchError;
use crate::pattern::WatchPattern;

/// Quiet period after the last matching event before a batch is reported.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(150);

/// A pattern and the target to report when it matches, e.g. a worker script.
#[derive(Debug, Clone)]
pub struct WatchEntry {
    pub pattern: WatchPattern,
    pub target: PathBuf,
}

impl WatchEntry {
    pub fn new(pattern: WatchPattern, target: impl Into<PathBuf>) -> Self {
        Self {
            pattern,
            target: target.into(),
        }
    }
}

type Callback = Arc<dyn Fn(&[PathBuf]) + Send + Sync>;

/// Debounced file watcher. The callback receives the targets whose patterns
/// matched during one quiet period and runs on tokio's blocking pool.
pub struct FileWatcher {
    // dropping it stops event delivery
    watcher: Option<RecommendedWatcher>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Must be called from within a tokio runtime.
    pub fn start<F>(
        entries: Vec<WatchEntry>,
        debounce: Duration,
        callback: F,
    ) -> Result<Self, WatchError>
    where
        F: Fn(&[PathBuf]) + Send + Sync + 'static,
    {
        let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = event_tx.send(res);
        })?;

        let dirs: BTreeSet<&Path> = entries.iter().map(|entry| entry.pattern.dir()).collect();
        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::Recursive)
                .map_err(|source| WatchError::Watch {
                    dir: dir.display().to_string(),
                    source,
                })?;
            tracing::debug!("watching {}", dir.display());
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(debounce_events(
            entries,
            event_rx,
            stop_rx,
            Arc::new(callback),
            debounce,
        ));

        Ok(Self {
            watcher: Some(watcher),
            stop_tx: Some(stop_tx),
            task: Some(task),
        })
    }

    /// Stop delivering events and wait for a callback that is still running.
    pub async fn stop(&mut self) {
        self.watcher.take();
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!("file watcher task failed: {}", err);
            }
        }
        tracing::debug!("file watcher stopped");
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn debounce_events(
    entries: Vec<WatchEntry>,
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    mut stop: oneshot::Receiver<()>,
    callback: Callback,
    debounce: Duration,
) {
    let mut pending = BTreeSet::new();
    let timer = sleep(debounce);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = events.recv() => match event {
                Some(Ok(event)) => {
                    let matched = matching_targets(&entries, &event);
                    if !matched.is_empty() {
                        pending.extend(matched);
                        timer.as_mut().reset(Instant::now() + debounce);
                    }
                }
                Some(Err(err)) => tracing::warn!("watch error: {}", err),
                None => break,
            },
            _ = &mut timer, if !pending.is_empty() => {
                let targets: Vec<PathBuf> = std::mem::take(&mut pending).into_iter().collect();
                tracing::info!("filesystem change detected, reloading {} targets", targets.len());
                let callback = Arc::clone(&callback);
                if let Err(err) = tokio::task::spawn_blocking(move || callback(&targets)).await {
                    tracing::error!("reload after file change failed: {}", err);
                }
            }
        }
    }
}

fn matching_targets(entries: &[WatchEntry], event: &Event) -> Vec<PathBuf> {
    if !triggers_reload(event) {
        return Vec::new();
    }
    let mut targets = Vec::new();
    for path in event.paths.iter().filter(|path| !is_symlink(path)) {
        for entry in entries {
            if entry.pattern.matches(path) && !targets.contains(&entry.target) {
                targets.push(entry.target.clone());
            }
        }
    }
    targets
}

/// Create, write, remove and rename. Access and metadata-only changes never
/// trigger a reload.
fn triggers_reload(event: &Event) -> bool {
    match event.kind {
        EventKind::Create(_) | EventKind::Remove(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => false,
    }
}

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|metadata| metadata.file_type().is_symlink())
        .unwrap_or(false)
}
