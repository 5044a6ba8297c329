#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use pool::{
    FatalHandler, PoolConfig, PoolError, RequestContext, ScriptContext, ScriptEngine, ThreadPool,
    WORKER_MODE_ENV, WorkerConfig,
};

pub const APP_ROOT: &str = "/srv/app";

pub fn script(name: &str) -> PathBuf {
    Path::new(APP_ROOT).join(name)
}

/// Stand-in interpreter. Scripts are picked by file name:
///
/// - `hello.php` answers with the thread index
/// - `slow.php` sleeps for `?ms=` milliseconds
/// - `panic.php` panics
/// - `counter.php` is a worker counting the requests of its current boot,
///   sleeping for `?ms=` milliseconds first when given
/// - `crash.php` is a worker that exits before reaching its request loop
#[derive(Default)]
pub struct FakeEngine {
    pub cache_resets: AtomicUsize,
    pub threads_started: AtomicUsize,
    pub threads_stopped: AtomicUsize,
    pub worker_boots: AtomicUsize,
}

impl ScriptEngine for FakeEngine {
    fn thread_started(&self, _index: usize) {
        self.threads_started.fetch_add(1, Ordering::SeqCst);
    }

    fn thread_stopped(&self, _index: usize) {
        self.threads_stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn run_script(&self, ctx: &mut ScriptContext<'_>, script: &Path) -> i32 {
        let name = script.file_name().and_then(|name| name.to_str()).unwrap_or("");
        match name {
            "hello.php" => {
                let index = ctx.thread_index();
                if let Some(request) = ctx.request() {
                    request.write(format!("hello from thread {index}").as_bytes());
                }
                0
            }
            "slow.php" => {
                if let Some(request) = ctx.request() {
                    let millis = delay_millis(request.uri()).unwrap_or(100);
                    thread::sleep(Duration::from_millis(millis));
                    request.write(b"slow");
                }
                0
            }
            "panic.php" => panic!("script blew up"),
            "counter.php" => {
                self.worker_boots.fetch_add(1, Ordering::SeqCst);
                let mode = ctx.env_var(WORKER_MODE_ENV).unwrap_or_default();
                let mut count = 0;
                loop {
                    let served = ctx.handle_request(|request| {
                        if let Some(millis) = delay_millis(request.uri()) {
                            thread::sleep(Duration::from_millis(millis));
                        }
                        count += 1;
                        request.set_header("X-Worker-Mode", mode.clone());
                        request.write(format!("requests:{count}").as_bytes());
                    });
                    match served {
                        Ok(true) => continue,
                        Ok(false) => return 0,
                        Err(_) => return 1,
                    }
                }
            }
            "crash.php" => {
                self.worker_boots.fetch_add(1, Ordering::SeqCst);
                1
            }
            _ => {
                if let Some(request) = ctx.request() {
                    request.set_status(404);
                }
                0
            }
        }
    }

    fn reset_cache(&self) {
        self.cache_resets.fetch_add(1, Ordering::SeqCst);
    }
}

fn delay_millis(uri: &str) -> Option<u64> {
    uri.split("ms=").nth(1).and_then(|ms| ms.parse().ok())
}

pub fn regular_config(num_threads: usize, max_threads: i64) -> PoolConfig {
    PoolConfig {
        num_threads,
        max_threads,
        ..PoolConfig::default()
    }
}

pub fn worker(name: &str, num_threads: usize) -> WorkerConfig {
    WorkerConfig {
        num_threads,
        ..WorkerConfig::new(script(name))
    }
}

/// Fatal errors land on the returned channel instead of exiting the test process.
pub fn collect_fatal() -> (FatalHandler, Receiver<PoolError>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let handler: FatalHandler = Arc::new(move |err: &PoolError| {
        let _ = tx.send(err.clone());
    });
    (handler, rx)
}

pub fn start(config: PoolConfig) -> (ThreadPool, Arc<FakeEngine>, Receiver<PoolError>) {
    let engine = Arc::new(FakeEngine::default());
    let (fatal, errors) = collect_fatal();
    let pool = ThreadPool::start_with_fatal_handler(config, engine.clone(), fatal)
        .expect("pool failed to start");
    (pool, engine, errors)
}

pub fn get(script_name: &str, uri: &str) -> Arc<RequestContext> {
    RequestContext::builder(script(script_name)).uri(uri).build()
}

pub fn serve_text(pool: &ThreadPool, request: Arc<RequestContext>) -> String {
    pool.serve(&request).expect("request failed");
    request.response().body_text()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
