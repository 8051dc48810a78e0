//! Persistent worker processes, one per module.
//!
//! Each module source path owns a slot. A slot holds at most one live
//! worker and a FIFO async mutex, so calls to the same module run one at a
//! time in arrival order while different modules run in parallel.
//!
//! ```text
//! absent -> starting -> ready <-> busy -> dead
//! ```
//!
//! A worker is spawned on the first call, checked for liveness before every
//! request and replaced transparently if it exited while idle. A failure
//! during an exchange kills it and fails that call with
//! [`CallError::WorkerUnavailable`]; the next call spawns a fresh one.
//! While a call is in progress the worker is owned by that call, so a
//! cancelled caller drops (and kills) it rather than leaving a reply in
//! the pipe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use onecall_registry::{CallError, WorkerSpec};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::ipc::{
    read_message, write_line, CallRequest, CallResponse, Handshake, ProtocolError,
    DEFAULT_MAX_LINE_SIZE,
};
use crate::launcher::{WorkerChannel, WorkerLauncher};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Terminate workers idle for longer than this.
    pub idle_timeout: Duration,
    /// How often the background reaper runs.
    pub reap_interval: Duration,
    /// Kill the worker if a single call takes longer than this.
    pub call_timeout: Option<Duration>,
    /// Maximum wait for the handshake after spawning.
    pub startup_timeout: Duration,
    /// Maximum protocol line size in bytes.
    pub max_line_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            reap_interval: Duration::from_secs(30),
            call_timeout: None,
            startup_timeout: Duration::from_secs(120),
            max_line_size: DEFAULT_MAX_LINE_SIZE,
        }
    }
}

/// Lifecycle state of a module's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, waiting for the handshake.
    Starting,
    /// Idle and ready for a request.
    Ready,
    /// Serving a request.
    Busy,
    /// Exited, killed or failed to start.
    Dead,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Ready,
            2 => Self::Busy,
            _ => Self::Dead,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Ready => 1,
            Self::Busy => 2,
            Self::Dead => 3,
        }
    }
}

/// Atomic counters for pool observability.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Workers spawned.
    pub spawned: AtomicU64,
    /// Requests sent.
    pub calls: AtomicU64,
    /// Workers that exited or broke the protocol.
    pub crashes: AtomicU64,
    /// Workers terminated for being idle.
    pub idle_reaped: AtomicU64,
    /// Calls that exceeded the call timeout.
    pub timeouts: AtomicU64,
}

/// Point-in-time view of one module's worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    /// Module source path.
    pub module: PathBuf,
    /// Current state.
    pub state: WorkerState,
    /// OS process id of the live worker.
    pub pid: Option<u32>,
    /// Milliseconds since the last completed call, when idle.
    pub idle_ms: Option<u64>,
    /// Calls served by the live worker.
    pub calls: u64,
}

struct LiveWorker {
    channel: WorkerChannel,
    pid: Option<u32>,
    last_activity: Instant,
    calls: u64,
}

impl LiveWorker {
    fn terminate(&mut self) {
        self.channel.process.terminate();
    }
}

#[derive(Default)]
struct SlotInner {
    worker: Option<LiveWorker>,
    /// Set once the slot is removed from the pool. Callers that raced the
    /// removal fetch a new slot.
    retired: bool,
}

struct Slot {
    state: AtomicU8,
    pid: AtomicU32,
    inner: Mutex<SlotInner>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Dead.as_u8()),
            pid: AtomicU32::new(0),
            inner: Mutex::new(SlotInner::default()),
        }
    }

    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn set_pid(&self, pid: Option<u32>) {
        self.pid.store(pid.unwrap_or(0), Ordering::Release);
    }

    fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }
}

/// One persistent worker per module, with crash recovery and idle eviction.
pub struct WorkerPool {
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    slots: Mutex<HashMap<PathBuf, Arc<Slot>>>,
    metrics: Arc<PoolMetrics>,
    shutting_down: AtomicBool,
}

impl WorkerPool {
    /// Create a pool that starts workers with `launcher`.
    pub fn new(config: PoolConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            config,
            launcher,
            slots: Mutex::new(HashMap::new()),
            metrics: Arc::new(PoolMetrics::default()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a reference to the pool metrics.
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// Call `function` in the worker for `spec.source`.
    ///
    /// Calls to one module are served one at a time, in arrival order.
    #[tracing::instrument(
        skip(self, spec, kwargs, config, secrets),
        fields(module = %spec.source.display())
    )]
    pub async fn call(
        &self,
        spec: &WorkerSpec,
        function: &str,
        kwargs: Map<String, Value>,
        config: Map<String, Value>,
        secrets: Map<String, Value>,
    ) -> Result<Value, CallError> {
        let request = CallRequest {
            function: function.to_string(),
            kwargs,
            config,
            secrets,
        };

        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(unavailable(&spec.source, "worker pool is shutting down"));
            }
            let slot = self.slot(&spec.source).await;
            let mut inner = slot.inner.lock().await;
            if inner.retired {
                continue;
            }
            return self.call_in_slot(&slot, &mut inner, spec, &request).await;
        }
    }

    async fn slot(&self, source: &Path) -> Arc<Slot> {
        let mut slots = self.slots.lock().await;
        Arc::clone(
            slots
                .entry(source.to_path_buf())
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }

    async fn call_in_slot(
        &self,
        slot: &Slot,
        inner: &mut SlotInner,
        spec: &WorkerSpec,
        request: &CallRequest,
    ) -> Result<Value, CallError> {
        let module = spec.source.display().to_string();

        let exited = inner
            .worker
            .as_mut()
            .is_some_and(|worker| worker.channel.process.has_exited());
        let mut worker = match inner.worker.take() {
            Some(mut worker) if exited => {
                tracing::warn!(module = %module, "worker exited while idle, respawning");
                self.metrics.crashes.fetch_add(1, Ordering::Relaxed);
                worker.terminate();
                slot.set_state(WorkerState::Dead);
                self.spawn(slot, spec).await?
            }
            Some(worker) => worker,
            None => self.spawn(slot, spec).await?,
        };

        slot.set_state(WorkerState::Busy);
        self.metrics.calls.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(module = %module, function = %request.function, "sending request");

        let exchange = exchange(&mut worker.channel, request, self.config.max_line_size);
        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => {
                    self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        module = %module,
                        function = %request.function,
                        timeout_ms = limit.as_millis() as u64,
                        "call timed out, killing worker"
                    );
                    worker.terminate();
                    slot.set_state(WorkerState::Dead);
                    slot.set_pid(None);
                    return Err(CallError::Timeout {
                        function: request.function.clone(),
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => exchange.await,
        };

        match outcome {
            Ok(reply) => {
                worker.last_activity = Instant::now();
                worker.calls += 1;
                inner.worker = Some(worker);
                slot.set_state(WorkerState::Ready);
                reply.map_err(|message| CallError::Failed {
                    function: request.function.clone(),
                    message,
                })
            }
            Err(e) => {
                self.metrics.crashes.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(module = %module, code = e.code(), error = %e, "worker transport failed");
                worker.terminate();
                slot.set_state(WorkerState::Dead);
                slot.set_pid(None);
                Err(unavailable(&spec.source, e.to_string()))
            }
        }
    }

    /// Launch a worker and wait for its handshake.
    async fn spawn(&self, slot: &Slot, spec: &WorkerSpec) -> Result<LiveWorker, CallError> {
        slot.set_state(WorkerState::Starting);
        let result = self.start_worker(spec).await;
        match &result {
            Ok(worker) => {
                slot.set_pid(worker.pid);
                tracing::info!(module = %spec.source.display(), pid = ?worker.pid, "worker ready");
            }
            Err(e) => {
                slot.set_state(WorkerState::Dead);
                slot.set_pid(None);
                tracing::warn!(module = %spec.source.display(), error = %e, "worker failed to start");
            }
        }
        result
    }

    async fn start_worker(&self, spec: &WorkerSpec) -> Result<LiveWorker, CallError> {
        let mut channel = self
            .launcher
            .launch(spec)
            .await
            .map_err(|e| unavailable(&spec.source, format!("failed to launch worker: {e}")))?;
        self.metrics.spawned.fetch_add(1, Ordering::Relaxed);

        let handshake = tokio::time::timeout(
            self.config.startup_timeout,
            read_message::<Handshake, _>(&mut channel.reader, self.config.max_line_size),
        )
        .await;
        let failure = match handshake {
            Ok(Ok(Some(Handshake { ready: true }))) => None,
            Ok(Ok(Some(_))) => Some("worker sent an invalid handshake".to_string()),
            Ok(Ok(None)) => Some("worker exited before becoming ready".to_string()),
            Ok(Err(e)) => Some(format!("handshake failed: {e}")),
            Err(_elapsed) => Some(format!(
                "worker did not become ready within {}s",
                self.config.startup_timeout.as_secs()
            )),
        };
        if let Some(reason) = failure {
            channel.process.terminate();
            return Err(unavailable(&spec.source, reason));
        }

        Ok(LiveWorker {
            pid: channel.process.id(),
            channel,
            last_activity: Instant::now(),
            calls: 0,
        })
    }

    /// Terminate workers idle beyond the idle timeout.
    ///
    /// Workers with a call in progress or queued are never touched.
    /// Returns the number of workers terminated.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let mut reaped = 0;

        let mut slots = self.slots.lock().await;
        slots.retain(|module, slot| {
            // Another holder is a caller about to queue on the slot
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let Ok(mut inner) = slot.inner.try_lock() else {
                return true;
            };
            let expired = inner
                .worker
                .as_ref()
                .is_none_or(|worker| now.duration_since(worker.last_activity) >= idle_timeout);
            if !expired {
                return true;
            }
            if let Some(mut worker) = inner.worker.take() {
                worker.terminate();
                reaped += 1;
                tracing::info!(module = %module.display(), "reaped idle worker");
            }
            inner.retired = true;
            slot.set_state(WorkerState::Dead);
            slot.set_pid(None);
            false
        });
        drop(slots);

        self.metrics
            .idle_reaped
            .fetch_add(reaped as u64, Ordering::Relaxed);
        reaped
    }

    /// Start a background task that periodically reaps idle workers.
    ///
    /// The task runs until the returned `JoinHandle` is aborted or the pool
    /// shuts down.
    pub fn start_reap_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = self.config.reap_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if pool.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                pool.reap_idle().await;
            }
        })
    }

    /// The live workers with their state, pid and idle time.
    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let now = Instant::now();
        let slots = self.slots.lock().await;
        let mut out: Vec<WorkerSnapshot> = slots
            .iter()
            .map(|(module, slot)| match slot.inner.try_lock() {
                Ok(inner) => match &inner.worker {
                    Some(worker) => WorkerSnapshot {
                        module: module.clone(),
                        state: slot.state(),
                        pid: worker.pid,
                        idle_ms: Some(now.duration_since(worker.last_activity).as_millis() as u64),
                        calls: worker.calls,
                    },
                    None => WorkerSnapshot {
                        module: module.clone(),
                        state: WorkerState::Dead,
                        pid: None,
                        idle_ms: None,
                        calls: 0,
                    },
                },
                Err(_) => WorkerSnapshot {
                    module: module.clone(),
                    state: slot.state(),
                    pid: slot.pid(),
                    idle_ms: None,
                    calls: 0,
                },
            })
            .collect();
        out.sort_by(|a, b| a.module.cmp(&b.module));
        out
    }

    /// Terminate every worker and refuse new calls.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let slots: Vec<(PathBuf, Arc<Slot>)> = self.slots.lock().await.drain().collect();
        for (module, slot) in slots {
            match tokio::time::timeout(Duration::from_secs(5), slot.inner.lock()).await {
                Ok(mut inner) => {
                    inner.retired = true;
                    if let Some(mut worker) = inner.worker.take() {
                        worker.terminate();
                    }
                }
                Err(_) => {
                    tracing::warn!(module = %module.display(), "worker busy during shutdown, leaving it to its caller");
                }
            }
            slot.set_state(WorkerState::Dead);
        }
        tracing::info!("worker pool shut down");
    }
}

/// Send one request and read exactly one response.
async fn exchange(
    channel: &mut WorkerChannel,
    request: &CallRequest,
    max_line_size: usize,
) -> Result<Result<Value, String>, ProtocolError> {
    write_line(&mut channel.writer, request).await?;
    match read_message::<CallResponse, _>(&mut channel.reader, max_line_size).await? {
        Some(response) => response.into_result(),
        None => Err(ProtocolError::Closed),
    }
}

fn unavailable(module: &Path, reason: impl Into<String>) -> CallError {
    CallError::WorkerUnavailable {
        module: module.display().to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            WorkerState::Starting,
            WorkerState::Ready,
            WorkerState::Busy,
            WorkerState::Dead,
        ] {
            assert_eq!(WorkerState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PoolConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.startup_timeout, Duration::from_secs(120));
        assert!(config.call_timeout.is_none());
        assert_eq!(config.max_line_size, 8 * 1024 * 1024);
    }

    #[test]
    fn snapshot_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(WorkerState::Busy).unwrap(),
            serde_json::json!("busy")
        );
    }
}
