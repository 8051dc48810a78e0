//! In-memory workers shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use onecall_engine::ipc::{read_message, write_line, CallRequest, CallResponse, DEFAULT_MAX_LINE_SIZE};
use onecall_engine::launcher::{WorkerChannel, WorkerLauncher, WorkerProcess};
use onecall_registry::WorkerSpec;
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};

struct FakeProcess {
    pid: u32,
    exited: Arc<AtomicBool>,
}

impl WorkerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn has_exited(&mut self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) {
        self.exited.store(true, Ordering::SeqCst);
    }
}

/// Launches in-memory workers that speak the line protocol.
#[derive(Default)]
pub struct FakeLauncher {
    next_pid: AtomicU32,
    launches: AtomicU64,
    exit_flags: Mutex<Vec<Arc<AtomicBool>>>,
    silent: bool,
}

impl FakeLauncher {
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Mark the most recently launched worker as exited.
    pub fn kill_last(&self) {
        if let Some(flag) = self.exit_flags.lock().unwrap().last() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, _spec: &WorkerSpec) -> std::io::Result<WorkerChannel> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        let exited = Arc::new(AtomicBool::new(false));
        self.exit_flags.lock().unwrap().push(exited.clone());

        let (host_writer, worker_reader) = tokio::io::duplex(64 * 1024);
        let (mut worker_writer, host_reader) = tokio::io::duplex(64 * 1024);
        let silent = self.silent;

        tokio::spawn(async move {
            if silent {
                // Never completes the handshake
                tokio::time::sleep(Duration::from_secs(60)).await;
                return;
            }
            let mut reader = BufReader::new(worker_reader);
            if write_line(&mut worker_writer, &json!({"ready": true})).await.is_err() {
                return;
            }
            while let Ok(Some(request)) =
                read_message::<CallRequest, _>(&mut reader, DEFAULT_MAX_LINE_SIZE).await
            {
                let response = match request.function.as_str() {
                    "echo" => CallResponse::ok(Value::Object(request.kwargs)),
                    "pid" => CallResponse::ok(json!(pid)),
                    "sleep" => {
                        let ms = request.kwargs.get("ms").and_then(Value::as_u64).unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        CallResponse::ok(json!(ms))
                    }
                    "context" => CallResponse::ok(json!({
                        "config": request.config,
                        "secrets": request.secrets,
                    })),
                    "fail" => CallResponse::err("deliberate failure"),
                    "crash" => return,
                    "garbage" => {
                        let _ = worker_writer.write_all(b"this is not json\n").await;
                        continue;
                    }
                    other => CallResponse::err(format!("unknown function {other}")),
                };
                if write_line(&mut worker_writer, &response).await.is_err() {
                    return;
                }
            }
        });

        Ok(WorkerChannel {
            writer: Box::new(host_writer),
            reader: Box::new(BufReader::new(host_reader)),
            process: Box::new(FakeProcess { pid, exited }),
        })
    }
}
