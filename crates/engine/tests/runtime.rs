use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use engine::{EngineError, RuntimeConfig, RuntimeEngine};
use pool::{
    FatalHandler, PoolConfig, PoolError, RequestContext, ScriptContext, ScriptEngine, ThreadPool,
    WorkerConfig,
};

const DEBOUNCE: Duration = Duration::from_millis(50);

/// `counter.php` counts requests per boot, anything else echoes its uri.
#[derive(Default)]
struct CountingEngine {
    cache_resets: AtomicUsize,
}

impl ScriptEngine for CountingEngine {
    fn run_script(&self, ctx: &mut ScriptContext<'_>, script: &Path) -> i32 {
        if !ctx.is_worker() {
            if let Some(request) = ctx.request() {
                if request.uri().contains("sleep") {
                    std::thread::sleep(Duration::from_millis(300));
                }
                request.write(format!("{} {}", script.display(), request.uri()).as_bytes());
            }
            return 0;
        }

        let mut count = 0;
        loop {
            match ctx.handle_request(|request| {
                count += 1;
                request.write(format!("requests:{count}").as_bytes());
            }) {
                Ok(true) => {}
                Ok(false) => return 0,
                Err(_) => return 1,
            }
        }
    }

    fn reset_cache(&self) {
        self.cache_resets.fetch_add(1, Ordering::SeqCst);
    }
}

fn fail_on_fatal() -> FatalHandler {
    Arc::new(|err: &PoolError| panic!("unexpected fatal error: {err}"))
}

fn start_pool(config: PoolConfig) -> (ThreadPool, Arc<CountingEngine>) {
    let script_engine = Arc::new(CountingEngine::default());
    let pool = ThreadPool::start_with_fatal_handler(config, script_engine.clone(), fail_on_fatal())
        .unwrap();
    (pool, script_engine)
}

async fn body(engine: &RuntimeEngine, script: &Path, uri: &str) -> String {
    let request = RequestContext::builder(script).uri(uri).build();
    engine.serve(request).await.unwrap().body_text()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serves_requests_on_the_blocking_pool() {
    let config = PoolConfig {
        num_threads: 2,
        max_threads: 2,
        ..PoolConfig::default()
    };
    let (pool, _script_engine) = start_pool(config);
    let engine = RuntimeEngine::with_pool(pool, DEBOUNCE).unwrap();

    let text = body(&engine, Path::new("/srv/app/index.php"), "/home").await;
    assert_eq!(text, "/srv/app/index.php /home");
    assert_eq!(engine.debug_state().thread_debug_states.len(), 2);

    assert!(matches!(
        engine.add_regular_thread().await,
        Err(EngineError::Pool(PoolError::MaxThreadsReached { count: 2 }))
    ));
    engine.shutdown().await.unwrap();

    let request = RequestContext::builder("/srv/app/index.php").build();
    let err = engine.serve(Arc::clone(&request)).await.unwrap_err();
    assert!(matches!(err.pool_error(), Some(PoolError::ShuttingDown)));
    assert_eq!(request.response().status, 503);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_request_stops_waiting_for_a_thread() {
    let config = PoolConfig {
        num_threads: 1,
        max_threads: 1,
        ..PoolConfig::default()
    };
    let (pool, _script_engine) = start_pool(config);
    let engine = Arc::new(RuntimeEngine::with_pool(pool, DEBOUNCE).unwrap());

    let busy = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { body(&engine, Path::new("/srv/app/a.php"), "/sleep").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let queued = RequestContext::builder("/srv/app/b.php").build();
    let waiting = tokio::time::timeout(Duration::from_millis(50), engine.serve(Arc::clone(&queued)));
    assert!(waiting.await.is_err());
    assert!(queued.is_cancelled());

    assert_eq!(busy.await.unwrap(), "/srv/app/a.php /sleep");
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_changes_restart_the_watching_worker() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    fs::create_dir_all(root.join("src")).unwrap();
    let worker_file: PathBuf = root.join("worker.php");

    let config = PoolConfig {
        num_threads: 2,
        max_threads: 2,
        workers: vec![WorkerConfig {
            watch: vec![format!("{}/src/**/*.php", root.display())],
            ..WorkerConfig::new(&worker_file)
        }],
        ..PoolConfig::default()
    };
    let (pool, script_engine) = start_pool(config);
    assert!(pool.watcher_enabled());
    let engine = RuntimeEngine::with_pool(pool, DEBOUNCE).unwrap();

    assert_eq!(body(&engine, &worker_file, "/").await, "requests:1");
    assert_eq!(body(&engine, &worker_file, "/").await, "requests:2");

    fs::write(root.join("src").join("controller.php"), "<?php").unwrap();
    let restarted = tokio::time::timeout(Duration::from_secs(5), async {
        while script_engine.cache_resets.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(restarted.is_ok(), "worker was not restarted");

    assert_eq!(body(&engine, &worker_file, "/").await, "requests:1");
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admin_operations_run_off_the_async_threads() {
    let config = PoolConfig {
        num_threads: 2,
        max_threads: 3,
        workers: vec![WorkerConfig::new("/srv/app/worker.php")],
        ..PoolConfig::default()
    };
    let (pool, script_engine) = start_pool(config);
    let engine = RuntimeEngine::with_pool(pool, DEBOUNCE).unwrap();

    assert_eq!(engine.add_worker_thread("worker.php").await.unwrap(), 2);
    assert_eq!(engine.remove_worker_thread("worker.php").await.unwrap(), 1);
    assert!(matches!(
        engine.remove_regular_thread().await,
        Err(EngineError::Pool(PoolError::CannotRemoveLastThread { count: 1 }))
    ));

    assert_eq!(engine.restart_workers().await.unwrap(), 1);
    assert_eq!(script_engine.cache_resets.load(Ordering::SeqCst), 1);
    engine.shutdown().await.unwrap();
}

#[test]
fn boots_from_a_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.toml");
    fs::write(
        &path,
        "[pool]\nnum_threads = 2\n\n[[worker]]\nfile_name = \"/srv/app/worker.php\"\n",
    )
    .unwrap();

    let config = RuntimeConfig::load(Some(&path)).unwrap();
    assert_eq!(config.source.as_deref(), Some(path.as_path()));
    let pool_config = config.pool_config_with(|_| None).unwrap();
    let (pool, _script_engine) = start_pool(pool_config);

    assert_eq!(pool.workers().len(), 1);
    assert_eq!(pool.regular_thread_count(), 1);
}
