//! Starting worker processes.
//!
//! The pool only sees a [`WorkerChannel`]: a writer, a line reader and a
//! handle to the process behind them. [`CommandLauncher`] produces one by
//! spawning the configured external package runner; tests substitute
//! in-memory pipes.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use onecall_registry::WorkerSpec;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

/// The launcher used when none is configured: `uv run --quiet --script`.
pub const DEFAULT_LAUNCHER: &[&str] = &["uv", "run", "--quiet", "--script"];

/// Environment variables always passed through to workers.
const BASE_ENV: &[&str] = &["PATH", "HOME"];

/// A running worker as seen by the pool.
pub trait WorkerProcess: Send {
    /// OS process id, if there is one.
    fn id(&self) -> Option<u32>;

    /// Returns whether the process has exited.
    fn has_exited(&mut self) -> bool;

    /// Kill the process without waiting for it.
    fn terminate(&mut self);
}

impl WorkerProcess for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.try_wait(), Ok(None))
    }

    fn terminate(&mut self) {
        let _ = self.start_kill();
    }
}

/// The pipes and process of one worker.
pub struct WorkerChannel {
    /// Requests go here.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Responses come from here.
    pub reader: Box<dyn AsyncBufRead + Send + Unpin>,
    /// The process behind the pipes.
    pub process: Box<dyn WorkerProcess>,
}

/// Starts a worker for a module.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker for `spec`. The handshake is read by the caller.
    async fn launch(&self, spec: &WorkerSpec) -> std::io::Result<WorkerChannel>;
}

/// Launches workers by running `<command...> [--with dep]... <source>`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    command: Vec<String>,
    dependency_flag: Option<String>,
    env_passthrough: Vec<String>,
}

impl Default for CommandLauncher {
    fn default() -> Self {
        Self {
            command: DEFAULT_LAUNCHER.iter().map(|s| s.to_string()).collect(),
            dependency_flag: Some("--with".into()),
            env_passthrough: Vec::new(),
        }
    }
}

impl CommandLauncher {
    /// A launcher running `command` followed by the module source path.
    /// Declared dependencies are not passed on the command line.
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            dependency_flag: None,
            env_passthrough: Vec::new(),
        }
    }

    /// Pass every declared dependency as `<flag> <dependency>`.
    pub fn with_dependency_flag(mut self, flag: impl Into<String>) -> Self {
        self.dependency_flag = Some(flag.into());
        self
    }

    /// Forward these environment variables in addition to `PATH` and `HOME`.
    pub fn with_env_passthrough(mut self, vars: Vec<String>) -> Self {
        self.env_passthrough = vars;
        self
    }

    fn build_command(&self, spec: &WorkerSpec) -> std::io::Result<Command> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "launcher command is empty")
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(flag) = &self.dependency_flag {
            for dep in &spec.dependencies {
                cmd.arg(flag).arg(dep);
            }
        }
        cmd.arg(&spec.source);
        if let Some(dir) = spec.source.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }

        cmd.env_clear();
        for var in BASE_ENV
            .iter()
            .copied()
            .chain(self.env_passthrough.iter().map(String::as_str))
        {
            if let Some(value) = std::env::var_os(var) {
                cmd.env(var, value);
            }
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> std::io::Result<WorkerChannel> {
        validate_source(&spec.source)?;
        let mut child = self.build_command(spec)?.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("no stdin on worker"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("no stdout on worker"))?;
        if let Some(stderr) = child.stderr.take() {
            let module = spec.source.display().to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "onecall::engine::worker", module = %module, "{line}");
                }
            });
        }

        tracing::debug!(module = %spec.source.display(), pid = ?child.id(), "worker spawned");
        Ok(WorkerChannel {
            writer: Box::new(stdin),
            reader: Box::new(BufReader::new(stdout)),
            process: Box::new(child),
        })
    }
}

/// The module source must be a regular file and, on Unix, must not be
/// world-writable.
pub fn validate_source(path: &Path) -> std::io::Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        std::io::Error::new(
            e.kind(),
            format!("cannot read worker module {}: {e}", path.display()),
        )
    })?;
    if !metadata.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("worker module {} is not a file", path.display()),
        ));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!(
                    "insecure permissions on worker module {}: mode {mode:o} is world-writable",
                    path.display()
                ),
            ));
        }
    }
    Ok(())
}
