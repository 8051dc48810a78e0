//! Worker pool behavior against real worker processes.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use onecall_engine::{
    CommandLauncher, CommandProcessor, EngineError, Executor, ExecutorConfig, PoolConfig,
    ProcessorSettings, WorkerPool,
};
use onecall_registry::{CallError, LiveRegistry, ParamSpec, Registry, RegistryEntry, WorkerSpec};
use serde_json::{json, Map, Value};
use serial_test::serial;
use tempfile::TempDir;

struct Fixture {
    pool: Arc<WorkerPool>,
    spec: WorkerSpec,
    dir: TempDir,
}

fn module_in(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, "# test module\n").unwrap();
    path
}

fn fixture_with(config: PoolConfig, launcher: CommandLauncher) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let spec = WorkerSpec::new(module_in(&dir, "tools.py"));
    Fixture {
        pool: Arc::new(WorkerPool::new(config, Arc::new(launcher))),
        spec,
        dir,
    }
}

fn launcher() -> CommandLauncher {
    CommandLauncher::new(vec![env!("CARGO_BIN_EXE_onecall-test-worker").to_string()])
}

fn fixture() -> Fixture {
    fixture_with(PoolConfig::default(), launcher())
}

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

impl Fixture {
    async fn call(&self, function: &str, kwargs: Value) -> Result<Value, CallError> {
        self.pool
            .call(&self.spec, function, object(kwargs), Map::new(), Map::new())
            .await
    }
}

#[tokio::test]
#[serial]
async fn spawned_worker_answers_and_is_reused() {
    let f = fixture();
    assert_eq!(f.call("add", json!({"a": 2, "b": 3})).await.unwrap(), json!(5.0));
    assert_eq!(
        f.call("echo", json!({"msg": "hi"})).await.unwrap(),
        json!({"msg": "hi"})
    );

    let first = f.call("pid", json!({})).await.unwrap();
    let second = f.call("pid", json!({})).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(f.pool.metrics().spawned.load(Ordering::Relaxed), 1);

    let snapshot = f.pool.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].pid.map(|p| json!(p)), Some(first));
    f.pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn reported_errors_keep_the_worker() {
    let f = fixture();
    let before = f.call("pid", json!({})).await.unwrap();
    let err = f.call("fail", json!({})).await.unwrap_err();
    assert!(matches!(err, CallError::Failed { ref message, .. } if message == "deliberate failure"));
    assert_eq!(f.call("pid", json!({})).await.unwrap(), before);
    f.pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn crash_is_unavailable_and_next_call_respawns() {
    let f = fixture();
    let before = f.call("pid", json!({})).await.unwrap();

    let err = f.call("crash", json!({})).await.unwrap_err();
    assert_eq!(err.code(), "WORKER_UNAVAILABLE");
    assert!(err.retryable());

    let after = f.call("pid", json!({})).await.unwrap();
    assert_ne!(before, after);
    assert_eq!(f.pool.metrics().spawned.load(Ordering::Relaxed), 2);
    f.pool.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn killed_idle_worker_is_replaced_on_next_call() {
    let f = fixture();
    let before = f.call("pid", json!({})).await.unwrap();

    let status = std::process::Command::new("kill")
        .arg("-9")
        .arg(before.to_string())
        .status()
        .unwrap();
    assert!(status.success());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let after = f.call("pid", json!({})).await.unwrap();
    assert_ne!(before, after);
    assert_eq!(f.pool.metrics().crashes.load(Ordering::Relaxed), 1);
    f.pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn idle_worker_is_reaped_then_respawned() {
    let config = PoolConfig {
        idle_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let f = fixture_with(config, launcher());
    let before = f.call("pid", json!({})).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(f.pool.reap_idle().await, 1);
    assert!(f.pool.snapshot().await.is_empty());

    let after = f.call("pid", json!({})).await.unwrap();
    assert_ne!(before, after);
    f.pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn call_timeout_kills_and_discards_the_late_reply() {
    let config = PoolConfig {
        call_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let f = fixture_with(config, launcher());
    let before = f.call("pid", json!({})).await.unwrap();

    let err = f.call("sleep", json!({"ms": 2000})).await.unwrap_err();
    assert!(matches!(err, CallError::Timeout { timeout_ms: 200, .. }));

    let after = f.call("pid", json!({})).await.unwrap();
    assert_ne!(before, after);
    f.pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn config_and_secrets_cross_the_pipe() {
    let f = fixture();
    let value = f
        .pool
        .call(
            &f.spec,
            "context",
            Map::new(),
            object(json!({"region": "eu"})),
            object(json!({"token": "s3cret"})),
        )
        .await
        .unwrap();
    assert_eq!(
        value,
        json!({"config": {"region": "eu"}, "secrets": {"token": "s3cret"}})
    );
    f.pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn environment_is_cleared_except_passthrough() {
    std::env::set_var("ONECALL_TEST_PASSTHROUGH", "visible");

    let closed = fixture();
    assert_eq!(
        closed
            .call("env", json!({"name": "ONECALL_TEST_PASSTHROUGH"}))
            .await
            .unwrap(),
        Value::Null
    );
    closed.pool.shutdown().await;

    let open = fixture_with(
        PoolConfig::default(),
        launcher().with_env_passthrough(vec!["ONECALL_TEST_PASSTHROUGH".into()]),
    );
    assert_eq!(
        open.call("env", json!({"name": "ONECALL_TEST_PASSTHROUGH"}))
            .await
            .unwrap(),
        json!("visible")
    );
    open.pool.shutdown().await;

    std::env::remove_var("ONECALL_TEST_PASSTHROUGH");
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn world_writable_module_is_refused() {
    use std::os::unix::fs::PermissionsExt;

    let f = fixture();
    std::fs::set_permissions(&f.spec.source, std::fs::Permissions::from_mode(0o666)).unwrap();

    let err = f.call("echo", json!({})).await.unwrap_err();
    assert!(
        matches!(err, CallError::WorkerUnavailable { ref reason, .. } if reason.contains("world-writable")),
        "{err:?}"
    );
    assert_eq!(f.pool.metrics().spawned.load(Ordering::Relaxed), 0);
}

#[tokio::test]
#[serial]
async fn missing_module_is_unavailable() {
    let f = fixture();
    let missing = WorkerSpec::new(f.dir.path().join("absent.py"));
    let err = f
        .pool
        .call(&missing, "echo", Map::new(), Map::new(), Map::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "WORKER_UNAVAILABLE");
}

#[tokio::test]
#[serial]
async fn modules_get_separate_processes() {
    let f = fixture();
    let other = WorkerSpec::new(module_in(&f.dir, "other.py"));

    let a = f.call("pid", json!({})).await.unwrap();
    let b = f
        .pool
        .call(&other, "pid", Map::new(), Map::new(), Map::new())
        .await
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(f.pool.snapshot().await.len(), 2);
    f.pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn command_timeout_frees_the_module_for_the_next_command() {
    let f = fixture();
    let registry = Registry::builder()
        .add(
            RegistryEntry::worker("slow", "sleep", f.spec.clone())
                .with_param(ParamSpec::required("ms")),
        )
        .add(RegistryEntry::worker("slow", "pid", f.spec.clone()))
        .build()
        .unwrap();
    let processor = CommandProcessor::new(
        LiveRegistry::new(registry),
        f.pool.clone(),
        Executor::new(ExecutorConfig {
            timeout: Duration::from_millis(200),
            ..Default::default()
        }),
        ProcessorSettings::default(),
    );

    let err = processor.run("slow.sleep(ms=10000)").await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout { .. }), "{err:?}");

    let pid = tokio::time::timeout(Duration::from_secs(5), processor.run_to_string("slow.pid()"))
        .await
        .expect("module still held by the abandoned call")
        .unwrap();
    assert!(pid.parse::<u64>().is_ok(), "{pid}");
    assert_eq!(f.pool.metrics().spawned.load(Ordering::Relaxed), 2);
    f.pool.shutdown().await;
}
