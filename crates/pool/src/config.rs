use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{DEFAULT_MAX_BACKOFF, DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_MIN_BACKOFF};
use crate::error::{PoolError, PoolResult};

/// `max_threads` value asking the pool to pick the limit itself.
pub const AUTO_MAX_THREADS: i64 = -1;

/// A resident worker script and the threads dedicated to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Path of the worker script, resolved against the current directory.
    pub file_name: PathBuf,
    /// Display name, defaults to the absolute script path.
    pub name: Option<String>,
    /// Threads started for this worker; autoscaling never goes below this.
    pub num_threads: usize,
    pub env: HashMap<String, String>,
    /// Files or directories whose changes restart the worker.
    pub watch: Vec<String>,
    /// Crashes in a row before giving up (-1 = never).
    pub max_consecutive_failures: i64,
    /// Bounds of the reboot delay of a crashing script, which doubles per crash.
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            file_name: PathBuf::new(),
            name: None,
            num_threads: 1,
            env: HashMap::new(),
            watch: Vec::new(),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES as i64,
            min_backoff_ms: DEFAULT_MIN_BACKOFF.as_millis() as u64,
            max_backoff_ms: DEFAULT_MAX_BACKOFF.as_millis() as u64,
        }
    }
}

impl WorkerConfig {
    pub fn new(file_name: impl Into<PathBuf>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Self::default()
        }
    }

    pub fn max_failures(&self) -> Option<u32> {
        u32::try_from(self.max_consecutive_failures).ok()
    }
}

/// Autoscaling knobs. Only used when `max_threads > num_threads`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// A queued request must have stalled this long before it may add a thread.
    pub min_stall_time_ms: u64,
    pub downscale_check_interval_ms: u64,
    /// Autoscaled threads idle for longer than this are scaled down.
    pub max_idle_time_ms: u64,
    /// Upper bound of threads stopped by one downscale sweep.
    pub max_termination_count: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_stall_time_ms: 5,
            downscale_check_interval_ms: 5_000,
            max_idle_time_ms: 5_000,
            max_termination_count: 10,
        }
    }
}

impl ScalingConfig {
    pub fn min_stall_time(&self) -> Duration {
        Duration::from_millis(self.min_stall_time_ms)
    }

    pub fn downscale_check_interval(&self) -> Duration {
        Duration::from_millis(self.downscale_check_interval_ms)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }
}

/// Configuration for the thread pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Threads booted at startup (default: 2 x num_cpus)
    pub num_threads: usize,
    /// Upper bound for autoscaling (-1 = automatic)
    pub max_threads: i64,
    /// Max time a request may wait for a thread in milliseconds (0 = no limit)
    pub max_wait_time_ms: u64,
    /// Pin each thread to a CPU core
    pub pin_threads: bool,
    pub workers: Vec<WorkerConfig>,
    pub scaling: ScalingConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let num_threads = default_num_threads();
        Self {
            num_threads,
            max_threads: num_threads as i64,
            max_wait_time_ms: 0,
            pin_threads: false,
            workers: Vec::new(),
            scaling: ScalingConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables
    ///
    /// Environment variables:
    /// - PHP_NUM_THREADS: Threads booted at startup
    /// - PHP_MAX_THREADS: Autoscaling limit (-1 = automatic)
    /// - PHP_MAX_WAIT_TIME_MS: Max time a request waits for a thread (0 = no limit)
    /// - PHP_PIN_THREADS: Pin threads to CPU cores (default: false)
    /// - PHP_WORKER: Worker script to start
    /// - PHP_WORKER_NUM: Threads for PHP_WORKER (default: 1)
    /// - PHP_WORKER_WATCH: Comma separated watch patterns for PHP_WORKER
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Override fields from `lookup`, which maps variable names to values.
    /// Unparsable values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(num_threads) = lookup("PHP_NUM_THREADS").and_then(|s| s.parse().ok()) {
            self.num_threads = num_threads;
        }
        if let Some(max_threads) = lookup("PHP_MAX_THREADS").and_then(|s| parse_max_threads(&s)) {
            self.max_threads = max_threads;
        }
        if let Some(wait) = lookup("PHP_MAX_WAIT_TIME_MS").and_then(|s| s.parse().ok()) {
            self.max_wait_time_ms = wait;
        }
        if let Some(pin) = lookup("PHP_PIN_THREADS") {
            self.pin_threads = pin != "false" && pin != "0";
        }

        if let Some(file_name) = lookup("PHP_WORKER").filter(|s| !s.is_empty()) {
            let mut worker = WorkerConfig::new(file_name);
            if let Some(num) = lookup("PHP_WORKER_NUM").and_then(|s| s.parse().ok()) {
                worker.num_threads = num;
            }
            if let Some(watch) = lookup("PHP_WORKER_WATCH") {
                worker.watch = watch
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            self.workers.retain(|existing| existing.file_name != worker.file_name);
            self.workers.push(worker);
        }
    }

    pub fn validate(&self) -> PoolResult<()> {
        if self.num_threads == 0 {
            return Err(PoolError::InvalidConfig(
                "num_threads must be at least 1".to_string(),
            ));
        }

        for worker in &self.workers {
            if worker.num_threads == 0 {
                return Err(PoolError::InvalidConfig(format!(
                    "worker {} needs at least 1 thread",
                    worker.file_name.display()
                )));
            }
            if worker.max_consecutive_failures < -1 {
                return Err(PoolError::InvalidConfig(format!(
                    "max_consecutive_failures of worker {} must be -1 or more",
                    worker.file_name.display()
                )));
            }
            if worker.min_backoff_ms > worker.max_backoff_ms {
                return Err(PoolError::InvalidConfig(format!(
                    "min_backoff_ms of worker {} exceeds max_backoff_ms",
                    worker.file_name.display()
                )));
            }
        }

        let worker_threads = self.worker_thread_count();
        if self.num_threads <= worker_threads {
            return Err(PoolError::InvalidConfig(format!(
                "num_threads ({}) must be greater than the number of worker threads ({})",
                self.num_threads, worker_threads
            )));
        }

        if self.max_threads != AUTO_MAX_THREADS && self.max_threads < self.num_threads as i64 {
            return Err(PoolError::InvalidConfig(format!(
                "max_threads ({}) must be greater than or equal to num_threads ({})",
                self.max_threads, self.num_threads
            )));
        }

        Ok(())
    }

    pub fn worker_thread_count(&self) -> usize {
        self.workers.iter().map(|worker| worker.num_threads).sum()
    }

    /// The number of thread slots the pool reserves.
    pub fn resolved_max_threads(&self) -> usize {
        if self.max_threads == AUTO_MAX_THREADS {
            return self.num_threads * 2;
        }
        usize::try_from(self.max_threads)
            .unwrap_or(self.num_threads)
            .max(self.num_threads)
    }

    pub fn max_wait_time(&self) -> Option<Duration> {
        (self.max_wait_time_ms > 0).then(|| Duration::from_millis(self.max_wait_time_ms))
    }
}

fn parse_max_threads(value: &str) -> Option<i64> {
    if value.eq_ignore_ascii_case("auto") {
        return Some(AUTO_MAX_THREADS);
    }
    value.parse().ok()
}

fn default_num_threads() -> usize {
    (num_cpus::get() * 2).max(2)
}
