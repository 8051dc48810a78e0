#![warn(missing_docs)]

//! onecall code-execution MCP server
//!
//! One `run` tool in front of every registered capability.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use onecall_config::watcher::ConfigWatcher;
use onecall_config::{EngineOverrides, OnecallConfig, WorkerOverrides};
use onecall_engine::{
    CommandLauncher, CommandProcessor, Executor, ExecutorConfig, LintCommand, PoolConfig,
    ProcessorSettings, SecurityPolicy, Snippet, Validator, WorkerPool,
};
use onecall_registry::builtins::meta_entries;
use onecall_registry::{
    CallValues, DeclaredModules, LiveRegistry, Registry, RegistryError, RegistrySource,
    WeakRegistry,
};
use onecall_server::{render_error, OnecallServer};
use rmcp::ServiceExt;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
usage: onecall [serve]          serve the run tool over MCP stdio
       onecall run [CODE|-]     run one command and print the result
       onecall check [CODE|-]   validate one command and print the report

Configuration is read from $ONECALL_CONFIG or ./onecall.toml.
Log verbosity follows RUST_LOG (default: info). Logs go to stderr.";

const DEFAULT_LINT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, PartialEq)]
enum Command {
    Serve,
    Run(String),
    Check(String),
}

fn parse_command(args: &[String]) -> Result<Command> {
    match args.first().map(String::as_str) {
        None | Some("serve") => Ok(Command::Serve),
        Some("run") => Ok(Command::Run(code_arg(&args[1..])?)),
        Some("check") => Ok(Command::Check(code_arg(&args[1..])?)),
        Some(other) => bail!("unknown command '{other}'\n\n{USAGE}"),
    }
}

/// The code for `run`/`check`: the single argument, or stdin for `-` or
/// nothing.
fn code_arg(rest: &[String]) -> Result<String> {
    match rest {
        [] => read_stdin(),
        [dash] if dash == "-" => read_stdin(),
        [code] => Ok(code.clone()),
        _ => bail!("expected a single code argument (quote it, or pass '-' to read stdin)"),
    }
}

fn read_stdin() -> Result<String> {
    std::io::read_to_string(std::io::stdin()).context("failed to read code from stdin")
}

/// Locate the config file.
///
/// Search order:
/// 1. `ONECALL_CONFIG` environment variable
/// 2. `./onecall.toml` in the current directory
/// 3. None (built-in defaults, not an error)
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ONECALL_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
        tracing::warn!(path = %p.display(), "ONECALL_CONFIG points at a missing file, ignoring");
    }

    let cwd = PathBuf::from("onecall.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

fn load_config(path: Option<&Path>) -> Result<OnecallConfig> {
    match path {
        Some(path) => OnecallConfig::from_file_with_env(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(OnecallConfig::from_toml("")?),
    }
}

/// Build ExecutorConfig from config overrides.
fn build_executor_config(overrides: &EngineOverrides) -> ExecutorConfig {
    let mut config = ExecutorConfig::default();
    if let Some(timeout) = overrides.timeout_secs {
        config.timeout = Duration::from_secs(timeout);
    }
    if let Some(heap) = overrides.max_heap_mb {
        config.max_heap_size = heap * 1024 * 1024;
    }
    if let Some(concurrent) = overrides.max_concurrent {
        config.max_concurrent = concurrent;
    }
    if let Some(calls) = overrides.max_calls {
        config.max_calls = calls;
    }
    if let Some(kb) = overrides.max_output_kb {
        config.max_output_size = kb * 1024;
    }
    config
}

/// Build PoolConfig from config overrides.
fn build_pool_config(overrides: &WorkerOverrides) -> PoolConfig {
    let mut config = PoolConfig::default();
    if let Some(secs) = overrides.idle_timeout_secs {
        config.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = overrides.reap_interval_secs {
        config.reap_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = overrides.call_timeout_secs {
        config.call_timeout = Some(Duration::from_secs(secs));
    }
    if let Some(secs) = overrides.startup_timeout_secs {
        config.startup_timeout = Duration::from_secs(secs);
    }
    config
}

fn build_launcher(overrides: &WorkerOverrides) -> CommandLauncher {
    let launcher = match &overrides.launcher {
        Some(command) => {
            let launcher = CommandLauncher::new(command.clone());
            let is_uv = command
                .first()
                .is_some_and(|program| Path::new(program).file_name() == Some(OsStr::new("uv")));
            // uv takes dependencies as repeated --with flags
            if is_uv {
                launcher.with_dependency_flag("--with")
            } else {
                launcher
            }
        }
        None => CommandLauncher::default(),
    };
    launcher.with_env_passthrough(overrides.env_passthrough.clone())
}

/// Aliases, snippets and validator policy: everything that can change
/// without a restart.
fn build_settings(config: &OnecallConfig) -> Result<ProcessorSettings> {
    let security = &config.security;
    let policy = SecurityPolicy::new(&security.blocked, &security.warned, &security.allowed)
        .context("invalid security pattern")?;

    let mut validator = Validator::new(policy);
    if let Some(kb) = config.engine.max_code_kb {
        validator = validator.with_max_code_size(kb * 1024);
    }
    if let Some(lint) = &security.lint {
        if let Some((program, args)) = lint.command.split_first() {
            validator = validator.with_lint(LintCommand {
                program: program.clone(),
                args: args.to_vec(),
                timeout: Duration::from_millis(lint.timeout_ms.unwrap_or(DEFAULT_LINT_TIMEOUT_MS)),
            });
        }
    }

    let snippets = config
        .snippets
        .iter()
        .map(|(name, snippet)| {
            let snippet = Snippet {
                description: snippet.description.clone(),
                params: snippet.params.clone(),
                body: snippet.body.clone(),
            };
            (name.clone(), snippet)
        })
        .collect();

    Ok(ProcessorSettings {
        aliases: config.aliases.clone(),
        snippets,
        validator,
        check_security: security.check,
    })
}

/// Discovery source that re-reads the config file on every reload.
struct ConfigSource {
    path: Option<PathBuf>,
    base_dir: PathBuf,
    registry: WeakRegistry,
}

impl ConfigSource {
    fn declared(&self, config: &OnecallConfig) -> DeclaredModules {
        DeclaredModules {
            modules: config.modules.clone(),
            base_dir: self.base_dir.clone(),
            builtins: meta_entries(self.registry.clone()),
            values: CallValues {
                config: config.values.clone(),
                secrets: config.secrets.0.clone(),
            },
        }
    }
}

impl RegistrySource for ConfigSource {
    fn discover(&self) -> Result<Registry, RegistryError> {
        let config = load_config(self.path.as_deref())
            .map_err(|e| RegistryError::Discovery(format!("{e:#}")))?;
        self.declared(&config).build()
    }
}

/// Relative module paths resolve against the config file's directory.
fn base_dir_for(path: Option<&Path>) -> Result<PathBuf> {
    match path.and_then(Path::parent) {
        Some(dir) if !dir.as_os_str().is_empty() => Ok(dir.to_path_buf()),
        _ => std::env::current_dir().context("cannot determine the current directory"),
    }
}

fn build_processor(config: &OnecallConfig, path: Option<&Path>) -> Result<Arc<CommandProcessor>> {
    let live = LiveRegistry::new(Registry::new());
    let source = ConfigSource {
        path: path.map(Path::to_path_buf),
        base_dir: base_dir_for(path)?,
        registry: live.downgrade(),
    };
    let live = live
        .with_source(Arc::new(source))
        .context("registry discovery failed")?;

    let registry = live.current();
    tracing::info!(
        namespaces = registry.namespace_names().len(),
        functions = registry.len(),
        "registry loaded"
    );

    let pool = Arc::new(WorkerPool::new(
        build_pool_config(&config.workers),
        Arc::new(build_launcher(&config.workers)),
    ));
    let executor = Executor::new(build_executor_config(&config.engine));
    Ok(Arc::new(CommandProcessor::new(
        live,
        pool,
        executor,
        build_settings(config)?,
    )))
}

fn reload_registry(processor: &CommandProcessor) {
    if let Err(e) = processor.registry().reload() {
        tracing::warn!(error = %e, "registry reload failed, keeping previous table");
    }
}

/// Apply a new config revision. Engine and worker limits only take effect
/// after a restart.
fn apply_config(processor: &CommandProcessor, config: &OnecallConfig) {
    match build_settings(config) {
        Ok(settings) => processor.update_settings(settings),
        Err(e) => tracing::warn!(error = %format!("{e:#}"), "settings rejected, keeping previous"),
    }
    reload_registry(processor);
}

fn spawn_config_applier(
    mut rx: watch::Receiver<Arc<OnecallConfig>>,
    processor: Arc<CommandProcessor>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let config = rx.borrow_and_update().clone();
            apply_config(&processor, &config);
        }
    })
}

async fn serve(processor: Arc<CommandProcessor>, config_path: Option<PathBuf>) -> Result<()> {
    let reaper = processor.pool().start_reap_task();

    let watcher = match &config_path {
        Some(path) => Some(Arc::new(ConfigWatcher::new(path)?)),
        None => None,
    };
    let watch_tasks = watcher.as_ref().map(|watcher| {
        let applier = spawn_config_applier(watcher.subscribe(), processor.clone());
        (watcher.clone().start(), applier)
    });

    tracing::info!("onecall server starting");

    // Serve over stdio (standard MCP transport)
    let service = OnecallServer::new(processor.clone())
        .serve(rmcp::transport::io::stdio())
        .await?;

    #[cfg(unix)]
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    let waiting = service.waiting();
    tokio::pin!(waiting);

    loop {
        let sighup_fut = async {
            #[cfg(unix)]
            {
                sighup.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            result = &mut waiting => { result?; break; }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal, stopping gracefully");
                break;
            }
            _ = sighup_fut => {
                tracing::info!("received SIGHUP, reloading");
                match &watcher {
                    // A published revision reaches the applier, which reloads the registry
                    Some(watcher) => {
                        watcher.reload();
                    }
                    None => reload_registry(&processor),
                }
            }
        }
    }

    reaper.abort();
    if let Some((watch_task, applier)) = watch_tasks {
        watch_task.abort();
        applier.abort();
    }
    Ok(())
}

async fn run_once(processor: &CommandProcessor, code: &str) -> ExitCode {
    match processor.run_to_string(code).await {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("{}", render_error(&e));
            ExitCode::FAILURE
        }
    }
}

fn check(processor: &CommandProcessor, code: &str) -> Result<ExitCode> {
    let report = processor.validate(code);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("onecall {}", env!("CARGO_PKG_VERSION"));
        return Ok(ExitCode::SUCCESS);
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{USAGE}");
        return Ok(ExitCode::SUCCESS);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = parse_command(&args)?;

    let path = find_config_file();
    match &path {
        Some(path) => tracing::info!(path = %path.display(), "loading config"),
        None => tracing::info!("no config file found, using built-in defaults"),
    }
    let config = load_config(path.as_deref())?;
    let processor = build_processor(&config, path.as_deref())?;

    let outcome = match command {
        Command::Serve => serve(processor.clone(), path).await.map(|()| ExitCode::SUCCESS),
        Command::Run(code) => Ok(run_once(&processor, &code).await),
        Command::Check(code) => check(&processor, &code),
    };

    processor.pool().shutdown().await;
    outcome
}
