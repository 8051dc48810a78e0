//! Worker pool behavior against in-memory workers.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::FakeLauncher;
use onecall_engine::{PoolConfig, WorkerPool, WorkerState};
use onecall_registry::{CallError, WorkerSpec};
use serde_json::{json, Map, Value};

fn pool_with(config: PoolConfig, launcher: Arc<FakeLauncher>) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(config, launcher))
}

fn kwargs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

async fn call(pool: &WorkerPool, module: &str, function: &str, args: Value) -> Result<Value, CallError> {
    pool.call(
        &WorkerSpec::new(module),
        function,
        kwargs(args),
        Map::new(),
        Map::new(),
    )
    .await
}

#[tokio::test]
async fn first_call_spawns_and_later_calls_reuse() {
    let launcher = Arc::new(FakeLauncher::default());
    let pool = pool_with(PoolConfig::default(), launcher.clone());

    let first = call(&pool, "mods/a.py", "pid", json!({})).await.unwrap();
    let second = call(&pool, "mods/a.py", "pid", json!({})).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(launcher.launches(), 1);
    assert_eq!(
        call(&pool, "mods/a.py", "echo", json!({"x": 1})).await.unwrap(),
        json!({"x": 1})
    );
    assert_eq!(pool.metrics().calls.load(Ordering::Relaxed), 3);
}

#[tokio::test]
async fn config_and_secrets_reach_the_worker() {
    let pool = pool_with(PoolConfig::default(), Arc::new(FakeLauncher::default()));
    let value = pool
        .call(
            &WorkerSpec::new("mods/a.py"),
            "context",
            Map::new(),
            kwargs(json!({"region": "eu"})),
            kwargs(json!({"token": "t"})),
        )
        .await
        .unwrap();
    assert_eq!(value, json!({"config": {"region": "eu"}, "secrets": {"token": "t"}}));
}

#[tokio::test]
async fn worker_errors_are_call_failures() {
    let pool = pool_with(PoolConfig::default(), Arc::new(FakeLauncher::default()));
    let err = call(&pool, "mods/a.py", "fail", json!({})).await.unwrap_err();
    assert!(matches!(err, CallError::Failed { ref message, .. } if message == "deliberate failure"));
    // The worker survives a reported error
    assert!(call(&pool, "mods/a.py", "echo", json!({})).await.is_ok());
    assert_eq!(pool.metrics().crashes.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn calls_to_one_module_are_serialized() {
    let pool = pool_with(PoolConfig::default(), Arc::new(FakeLauncher::default()));
    call(&pool, "mods/a.py", "echo", json!({})).await.unwrap();

    let start = Instant::now();
    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { call(&pool, "mods/a.py", "sleep", json!({"ms": 100})).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert!(start.elapsed() >= Duration::from_millis(290), "{:?}", start.elapsed());
}

#[tokio::test]
async fn calls_to_different_modules_overlap() {
    let launcher = Arc::new(FakeLauncher::default());
    let pool = pool_with(PoolConfig::default(), launcher.clone());
    for module in ["mods/a.py", "mods/b.py", "mods/c.py"] {
        call(&pool, module, "echo", json!({})).await.unwrap();
    }

    let start = Instant::now();
    let tasks: Vec<_> = ["mods/a.py", "mods/b.py", "mods/c.py"]
        .into_iter()
        .map(|module| {
            let pool = pool.clone();
            tokio::spawn(async move { call(&pool, module, "sleep", json!({"ms": 200})).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert!(start.elapsed() < Duration::from_millis(550), "{:?}", start.elapsed());
    assert_eq!(launcher.launches(), 3);
}

#[tokio::test]
async fn idle_workers_are_reaped_and_respawned() {
    let launcher = Arc::new(FakeLauncher::default());
    let config = PoolConfig {
        idle_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let pool = pool_with(config, launcher.clone());

    let before = call(&pool, "mods/a.py", "pid", json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.reap_idle().await, 1);
    assert!(pool.snapshot().await.is_empty());

    let after = call(&pool, "mods/a.py", "pid", json!({})).await.unwrap();
    assert_ne!(before, after);
    assert_eq!(launcher.launches(), 2);
    assert_eq!(pool.metrics().idle_reaped.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn reaper_skips_busy_workers() {
    let config = PoolConfig {
        idle_timeout: Duration::from_millis(1),
        ..Default::default()
    };
    let pool = pool_with(config, Arc::new(FakeLauncher::default()));
    call(&pool, "mods/a.py", "echo", json!({})).await.unwrap();

    let busy = {
        let pool = pool.clone();
        tokio::spawn(async move { call(&pool, "mods/a.py", "sleep", json!({"ms": 200})).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.reap_idle().await, 0);
    assert_eq!(busy.await.unwrap().unwrap(), json!(200));
}

#[tokio::test]
async fn transport_failure_is_worker_unavailable_then_respawns() {
    let launcher = Arc::new(FakeLauncher::default());
    let pool = pool_with(PoolConfig::default(), launcher.clone());

    let err = call(&pool, "mods/a.py", "crash", json!({})).await.unwrap_err();
    assert_eq!(err.code(), "WORKER_UNAVAILABLE");
    assert!(err.retryable());
    assert_eq!(pool.metrics().crashes.load(Ordering::Relaxed), 1);

    assert!(call(&pool, "mods/a.py", "echo", json!({})).await.is_ok());
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test]
async fn malformed_response_is_worker_unavailable() {
    let pool = pool_with(PoolConfig::default(), Arc::new(FakeLauncher::default()));
    let err = call(&pool, "mods/a.py", "garbage", json!({})).await.unwrap_err();
    assert!(matches!(err, CallError::WorkerUnavailable { ref reason, .. } if reason.contains("malformed")));
}

#[tokio::test]
async fn worker_that_exited_while_idle_is_replaced_transparently() {
    let launcher = Arc::new(FakeLauncher::default());
    let pool = pool_with(PoolConfig::default(), launcher.clone());

    let before = call(&pool, "mods/a.py", "pid", json!({})).await.unwrap();
    launcher.kill_last();

    let after = call(&pool, "mods/a.py", "pid", json!({})).await.unwrap();
    assert_ne!(before, after);
    assert_eq!(launcher.launches(), 2);
    assert_eq!(pool.metrics().crashes.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn call_timeout_kills_the_worker() {
    let launcher = Arc::new(FakeLauncher::default());
    let config = PoolConfig {
        call_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let pool = pool_with(config, launcher.clone());

    let err = call(&pool, "mods/a.py", "sleep", json!({"ms": 1000})).await.unwrap_err();
    assert!(matches!(err, CallError::Timeout { timeout_ms: 50, .. }));
    assert_eq!(pool.metrics().timeouts.load(Ordering::Relaxed), 1);

    // The late reply died with the old worker
    assert_eq!(
        call(&pool, "mods/a.py", "echo", json!({"n": 2})).await.unwrap(),
        json!({"n": 2})
    );
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test]
async fn missing_handshake_times_out() {
    let config = PoolConfig {
        startup_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let pool = pool_with(config, Arc::new(FakeLauncher::silent()));
    let err = call(&pool, "mods/a.py", "echo", json!({})).await.unwrap_err();
    assert!(matches!(err, CallError::WorkerUnavailable { ref reason, .. } if reason.contains("ready")));
}

#[tokio::test]
async fn snapshot_lists_live_workers() {
    let pool = pool_with(PoolConfig::default(), Arc::new(FakeLauncher::default()));
    call(&pool, "mods/b.py", "echo", json!({})).await.unwrap();
    call(&pool, "mods/a.py", "echo", json!({})).await.unwrap();

    let snapshot = pool.snapshot().await;
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot[0].module.ends_with("a.py"));
    assert_eq!(snapshot[0].state, WorkerState::Ready);
    assert!(snapshot[0].pid.is_some());
    assert_eq!(snapshot[0].calls, 1);
}

#[tokio::test]
async fn shutdown_refuses_new_calls() {
    let pool = pool_with(PoolConfig::default(), Arc::new(FakeLauncher::default()));
    call(&pool, "mods/a.py", "echo", json!({})).await.unwrap();
    pool.shutdown().await;

    let err = call(&pool, "mods/a.py", "echo", json!({})).await.unwrap_err();
    assert_eq!(err.code(), "WORKER_UNAVAILABLE");
    assert!(pool.snapshot().await.is_empty());
}
