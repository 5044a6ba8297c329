mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use common::{eventually, get, regular_config, script, serve_text, start, worker};
use pool::{PoolError, StateId, WorkerConfig};

fn counter_pool(worker_threads: usize, max_threads: i64) -> pool::PoolConfig {
    let mut config = regular_config(worker_threads + 1, max_threads);
    config.workers = vec![worker("counter.php", worker_threads)];
    config
}

#[test]
fn worker_keeps_state_between_requests() {
    let (pool, engine, _errors) = start(counter_pool(1, 2));

    assert_eq!(serve_text(&pool, get("counter.php", "/")), "requests:1");
    let request = get("counter.php", "/");
    pool.serve(&request).unwrap();
    let response = request.response();
    assert_eq!(response.body_text(), "requests:2");
    assert_eq!(response.header("X-Worker-Mode"), Some("1"));
    assert_eq!(request.exit_status(), Some(0));
    assert_eq!(engine.worker_boots.load(Ordering::SeqCst), 1);

    // other scripts still go to regular threads
    assert!(serve_text(&pool, get("hello.php", "/")).starts_with("hello from thread"));
}

#[test]
fn restart_reboots_the_script_and_flushes_the_cache_once() {
    let (pool, engine, _errors) = start(counter_pool(2, 3));

    // both worker threads reached their request loop
    assert!(eventually(Duration::from_secs(2), || {
        engine.worker_boots.load(Ordering::SeqCst) == 2
    }));
    assert_eq!(serve_text(&pool, get("counter.php", "/")), "requests:1");

    assert_eq!(pool.restart_workers(), Ok(2));
    assert_eq!(engine.cache_resets.load(Ordering::SeqCst), 1);

    assert!(eventually(Duration::from_secs(2), || {
        engine.worker_boots.load(Ordering::SeqCst) == 4
    }));
    assert_eq!(serve_text(&pool, get("counter.php", "/")), "requests:1");
    assert_eq!(pool.debug_state().threads_in(StateId::Yielding), 0);
}

#[test]
fn restart_lets_the_request_in_flight_finish() {
    let (pool, engine, _errors) = start(counter_pool(1, 2));
    let pool = Arc::new(pool);
    assert!(eventually(Duration::from_secs(2), || {
        engine.worker_boots.load(Ordering::SeqCst) == 1
    }));

    let client = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || serve_text(&pool, get("counter.php", "/?ms=200")))
    };
    assert!(eventually(Duration::from_secs(2), || {
        pool.debug_state().threads_in(StateId::Busy) == 1
    }));

    assert_eq!(pool.restart_workers(), Ok(1));
    assert_eq!(client.join().unwrap(), "requests:1");
    assert_eq!(engine.cache_resets.load(Ordering::SeqCst), 1);

    assert!(eventually(Duration::from_secs(2), || {
        engine.worker_boots.load(Ordering::SeqCst) == 2
    }));
    assert_eq!(serve_text(&pool, get("counter.php", "/")), "requests:1");
}

#[test]
fn restart_by_file_only_touches_matching_workers() {
    let (pool, engine, _errors) = start(counter_pool(1, 2));

    assert_eq!(pool.restart_workers_by_file(&[script("other.php")]), Ok(0));
    assert_eq!(engine.cache_resets.load(Ordering::SeqCst), 0);

    assert_eq!(pool.restart_workers_by_file(&[script("counter.php")]), Ok(1));
    assert_eq!(engine.cache_resets.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_requests_share_the_worker_queue() {
    let (pool, _engine, _errors) = start(counter_pool(1, 2));
    let pool = Arc::new(pool);

    let clients: Vec<_> = (0..4)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || serve_text(&pool, get("counter.php", "/")))
        })
        .collect();
    let mut bodies: Vec<String> = clients.into_iter().map(|c| c.join().unwrap()).collect();
    bodies.sort();

    assert_eq!(
        bodies,
        vec!["requests:1", "requests:2", "requests:3", "requests:4"]
    );
}

#[test]
fn admin_adds_and_removes_worker_threads() {
    let (pool, _engine, _errors) = start(counter_pool(1, 3));

    assert_eq!(
        pool.remove_worker_thread("counter.php"),
        Err(PoolError::CannotRemoveLastThread { count: 1 })
    );
    assert_eq!(pool.add_worker_thread("counter.php"), Ok(2));
    assert_eq!(pool.remove_worker_thread("counter.php"), Ok(1));
    assert_eq!(pool.worker("counter.php").unwrap().count_threads(), 1);

    assert!(matches!(
        pool.add_worker_thread("missing.php"),
        Err(PoolError::WorkerNotFound(_))
    ));
}

#[test]
fn worker_names_are_listed() {
    let mut config = counter_pool(1, 2);
    config.workers[0] = WorkerConfig {
        name: Some("counter".to_string()),
        ..config.workers[0].clone()
    };
    let (pool, _engine, _errors) = start(config);

    let workers = pool.workers();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].name(), "counter");
    assert_eq!(workers[0].file_name(), script("counter.php"));
    assert!(pool.worker("counter").is_some());
}

#[test]
fn crash_looping_worker_is_fatal_without_a_watcher() {
    let mut config = regular_config(2, 2);
    config.workers = vec![WorkerConfig {
        max_consecutive_failures: 2,
        ..worker("crash.php", 1)
    }];
    let (pool, engine, errors) = start(config);

    let err = errors.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(
        err,
        PoolError::TooManyFailures {
            worker: script("crash.php").to_string_lossy().into_owned(),
            failures: 2,
        }
    );
    assert!(err.is_fatal());
    assert_eq!(engine.worker_boots.load(Ordering::SeqCst), 2);
    assert!(!pool.watcher_enabled());
}

#[test]
fn crash_looping_worker_keeps_retrying_while_watched() {
    let mut config = regular_config(2, 2);
    config.workers = vec![WorkerConfig {
        max_consecutive_failures: 2,
        watch: vec!["/srv/app/**/*.php".to_string()],
        ..worker("crash.php", 1)
    }];
    let (pool, engine, errors) = start(config);
    assert!(pool.watcher_enabled());

    assert!(eventually(Duration::from_secs(3), || {
        engine.worker_boots.load(Ordering::SeqCst) >= 3
    }));
    assert!(errors.try_recv().is_err());
}

#[test]
fn shutdown_interrupts_a_crashed_worker_backing_off() {
    let mut config = regular_config(2, 2);
    config.workers = vec![WorkerConfig {
        max_consecutive_failures: -1,
        min_backoff_ms: 5_000,
        max_backoff_ms: 5_000,
        watch: vec!["/srv/app/**/*.php".to_string()],
        ..worker("crash.php", 1)
    }];
    let (pool, engine, errors) = start(config);

    assert!(eventually(Duration::from_secs(2), || {
        engine.worker_boots.load(Ordering::SeqCst) == 1
    }));
    // let the first crash land so the thread sits in its backoff
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    pool.shutdown();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(engine.worker_boots.load(Ordering::SeqCst), 1);
    assert!(errors.try_recv().is_err());
}
