//! Command executor: runs resolved commands in fresh V8 isolates.
//!
//! Each command gets a brand new runtime. No state leaks between commands.
//!
//! V8 isolates are `!Send`, so every JsRuntime operation runs on a dedicated
//! thread with its own single-threaded tokio runtime. Capability calls made
//! by the command are spawned back onto the caller's runtime, which owns the
//! worker processes and their pipes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::dispatch::Dispatcher;
use crate::error::EngineError;
use crate::ops::{onecall_ext, CallBudget, CallRuntime, ExecutionResult};
use crate::resolve::ResolvedCommand;
use crate::wrap::{self, SCRIPT_NAME};

/// Limits applied to every command.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum wall-clock time before the isolate is terminated.
    pub timeout: Duration,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum concurrent commands.
    pub max_concurrent: usize,
    /// Maximum size of the serialized result in bytes.
    pub max_output_size: usize,
    /// Maximum capability calls per command.
    pub max_calls: usize,
    /// Maximum serialized keyword-argument size per call.
    pub max_args_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_heap_size: 64 * 1024 * 1024,
            max_concurrent: 8,
            max_output_size: 1024 * 1024,
            max_calls: 100,
            max_args_size: 1024 * 1024,
        }
    }
}

/// What a command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A value, including an explicit `null`.
    Value(Value),
    /// Neither a return nor a final expression with a value.
    NoValue,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(Value::String(s)) => f.write_str(s),
            Self::Value(value) => write!(f, "{value}"),
            Self::NoValue => f.write_str("(no value produced)"),
        }
    }
}

/// Executes resolved commands with per-command isolation and limits.
pub struct Executor {
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
}

impl Executor {
    /// Create an executor with the given limits.
    pub fn new(config: ExecutorConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self { config, semaphore }
    }

    /// The limits in effect.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run a resolved command. `source_lines` is the line count of the
    /// submitted source, used to map stack frames back onto it.
    pub async fn execute(
        &self,
        command: &ResolvedCommand,
        source_lines: usize,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Outcome, EngineError> {
        let _permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            })?;

        let command = command.clone();
        let config = self.config.clone();
        let calls = CallRuntime(tokio::runtime::Handle::current());

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    if tx.send(Err(EngineError::Execution(e.into()))).is_err() {
                        tracing::warn!("command result receiver dropped");
                    }
                    return;
                }
            };
            let result = rt.block_on(run_command(&config, &command, source_lines, dispatcher, calls));
            if tx.send(result).is_err() {
                tracing::warn!("command result receiver dropped before result was sent");
            }
        });

        rx.await
            .map_err(|_| EngineError::Execution(anyhow::anyhow!("command thread panicked")))?
    }
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates execution and grants 1MB grace for the termination to
/// propagate.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed HeapLimitState created in
    // `run_command`, which lives until after the event loop has finished.
    // Only the atomic flag and the thread-safe handle are touched.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Run one command on the current thread. Must be called from a dedicated
/// thread, not the host runtime.
async fn run_command(
    config: &ExecutorConfig,
    command: &ResolvedCommand,
    source_lines: usize,
    dispatcher: Arc<Dispatcher>,
    calls: CallRuntime,
) -> Result<Outcome, EngineError> {
    let namespaces = namespace_table(&dispatcher);
    let mut runtime = create_runtime(config, dispatcher, calls);

    runtime
        .execute_script("[onecall:bootstrap]", bootstrap(&namespaces)?)
        .map_err(|e| EngineError::Execution(anyhow::anyhow!("bootstrap failed: {e}")))?;

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let timeout = config.timeout;
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    let exec_error = match runtime.execute_script(SCRIPT_NAME, wrap::wrap(&command.code)) {
        Ok(_) => match tokio::time::timeout(
            config.timeout,
            runtime.run_event_loop(PollEventLoopOptions::default()),
        )
        .await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => {
                timed_out.store(true, Ordering::SeqCst);
                None
            }
        },
        Err(e) => Some(e.to_string()),
    };

    // The watchdog holds an isolate handle; it must be gone before the
    // runtime is dropped.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(EngineError::HeapLimitExceeded);
    }
    if timed_out.load(Ordering::SeqCst) {
        return Err(EngineError::Timeout {
            timeout_ms: config.timeout.as_millis() as u64,
        });
    }

    let result = {
        let state = runtime.op_state();
        let state = state.borrow();
        state.try_borrow::<ExecutionResult>().map(|r| r.0.clone())
    };
    let Some(result) = result else {
        let message = exec_error.unwrap_or_else(|| "command produced no result".into());
        return Err(runtime_error_from_message(&message, source_lines));
    };
    if let Some(message) = exec_error {
        tracing::debug!(error = %message, "event loop error after the command finished");
    }

    if result.len() > config.max_output_size {
        return Err(EngineError::OutputTooLarge {
            max: config.max_output_size,
        });
    }

    let report: Report = serde_json::from_str(&result)?;
    report.into_outcome(command, source_lines)
}

/// Create a fresh JsRuntime with the onecall extension loaded and V8 heap
/// limits set.
fn create_runtime(config: &ExecutorConfig, dispatcher: Arc<Dispatcher>, calls: CallRuntime) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);

    let runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![onecall_ext::init()],
        create_params: Some(create_params),
        ..Default::default()
    });

    {
        let op_state = runtime.op_state();
        let mut st = op_state.borrow_mut();
        st.put(dispatcher);
        st.put(calls);
        st.put(CallBudget {
            max_calls: config.max_calls,
            max_args_size: config.max_args_size,
            calls_made: 0,
        });
    }

    runtime
}

/// Function names per namespace in the command's registry snapshot.
fn namespace_table(dispatcher: &Dispatcher) -> BTreeMap<String, Vec<String>> {
    dispatcher
        .registry()
        .namespaces()
        .map(|ns| (ns.name.clone(), ns.functions.keys().cloned().collect()))
        .collect()
}

/// The script run before the command: namespace objects, console routing,
/// the `__onecall` result helpers, and removal of code-generation
/// primitives.
fn bootstrap(namespaces: &BTreeMap<String, Vec<String>>) -> Result<String, EngineError> {
    let table = serde_json::to_string(namespaces)?;
    Ok(format!(
        r#"((ops) => {{
    const invokeOp = ops.op_onecall_invoke;
    const setResult = (json) => ops.op_onecall_set_result(json);
    const show = (v) => {{
        if (typeof v === "string") return v;
        try {{ return JSON.stringify(v) ?? String(v); }} catch (_) {{ return String(v); }}
    }};
    const log = (level) => (...args) => ops.op_onecall_log(level, args.map(show).join(" "));

    class CallFailure extends Error {{
        constructor(failure) {{
            super(failure.message);
            this.name = failure.kind;
            this.code = failure.code;
            this.target = failure.target;
            this.retryable = failure.retryable;
        }}
    }}

    const invoke = async (name, kwargs) => {{
        const reply = JSON.parse(await invokeOp(name, JSON.stringify(kwargs ?? {{}})));
        if (reply.error) throw new CallFailure(reply.error);
        return reply.ok;
    }};

    const calls = new WeakMap();
    const table = {table};
    for (const [ns, names] of Object.entries(table)) {{
        const functions = {{}};
        for (const name of names) {{
            const target = ns + "." + name;
            functions[name] = (kwargs) => {{
                const pending = invoke(target, kwargs);
                calls.set(pending, target);
                return pending;
            }};
        }}
        Object.defineProperty(globalThis, ns, {{
            value: Object.freeze(functions), writable: false, configurable: false, enumerable: true
        }});
    }}

    globalThis.console = Object.freeze({{
        log: log("info"), info: log("info"), debug: log("debug"),
        warn: log("warn"), error: log("error")
    }});

    // A promise in the result is a call nobody waited for, usually one
    // made inside a plain callback such as `xs.map(x => ns.fn(x))`.
    const settled = (_key, v) => {{
        if (v instanceof Promise) {{
            const target = calls.get(v);
            throw new TypeError(
                (target ? "result contains an unawaited call to " + target : "result contains an unawaited promise") +
                "; make the callback async and await it, e.g. await Promise.all(xs.map(async (x) => ...))"
            );
        }}
        return v;
    }};
    const none = Object.freeze({{}});
    const finish = (v) => {{
        if (v === none) {{
            setResult(JSON.stringify({{ kind: "none" }}));
        }} else if (v === undefined || v === null) {{
            setResult(JSON.stringify({{ kind: "value", value: null }}));
        }} else {{
            setResult(JSON.stringify({{ kind: "value", value: v }}, settled));
        }}
    }};
    const fail = (e) => {{
        const report = {{ kind: "error" }};
        if (e instanceof Error) {{
            report.type = e.name;
            report.message = e.message;
            report.stack = String(e.stack ?? "");
        }} else {{
            report.type = "Error";
            report.message = show(e);
        }}
        if (e instanceof CallFailure) {{
            report.call = {{ kind: e.name, code: e.code, target: e.target, retryable: e.retryable }};
        }}
        setResult(JSON.stringify(report));
    }};
    Object.defineProperty(globalThis, "__onecall", {{
        value: Object.freeze({{
            none,
            tail: (v) => (v === undefined ? none : v),
            finish,
            fail
        }}),
        writable: false, configurable: false, enumerable: false
    }});

    delete globalThis.Deno;
    delete globalThis.eval;
    const AsyncFunction = (async function(){{}}).constructor;
    const GeneratorFunction = (function*(){{}}).constructor;
    const AsyncGeneratorFunction = (async function*(){{}}).constructor;
    for (const F of [Function, AsyncFunction, GeneratorFunction, AsyncGeneratorFunction]) {{
        Object.defineProperty(F.prototype, 'constructor', {{
            value: undefined, configurable: false, writable: false
        }});
    }}
}})(Deno.core.ops);"#
    ))
}

/// The outcome reported by the `__onecall` helpers.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Report {
    Value {
        #[serde(default)]
        value: Value,
    },
    None,
    Error {
        #[serde(rename = "type")]
        error_type: String,
        message: String,
        #[serde(default)]
        stack: Option<String>,
        #[serde(default)]
        call: Option<CallReport>,
    },
}

#[derive(Debug, Deserialize)]
struct CallReport {
    kind: String,
    code: String,
    target: String,
    #[serde(default)]
    retryable: bool,
}

impl Report {
    fn into_outcome(self, command: &ResolvedCommand, source_lines: usize) -> Result<Outcome, EngineError> {
        match self {
            Self::Value { value } => Ok(Outcome::Value(value)),
            Self::None => Ok(Outcome::NoValue),
            Self::Error {
                error_type,
                message,
                stack,
                call,
            } => {
                let line = stack
                    .as_deref()
                    .and_then(|s| wrap::line_from_stack(s, source_lines));
                Err(match call {
                    Some(call) => EngineError::Capability {
                        line: line.or_else(|| command.single_call_line(&call.target)),
                        kind: call.kind,
                        code: call.code,
                        message,
                        retryable: call.retryable,
                    },
                    None => EngineError::Runtime {
                        error_type,
                        message,
                        line,
                    },
                })
            }
        }
    }
}

/// Turn an uncaught error printed by the runtime, e.g.
/// `Uncaught (in promise) TypeError: x is not a function`, into a
/// runtime error.
fn runtime_error_from_message(message: &str, source_lines: usize) -> EngineError {
    let first = message.lines().next().unwrap_or_default();
    let first = first.strip_prefix("Uncaught ").unwrap_or(first);
    let first = first.strip_prefix("(in promise) ").unwrap_or(first);
    let (error_type, text) = match first.split_once(": ") {
        Some((name, rest)) if is_error_name(name) => (name.to_string(), rest.to_string()),
        _ => ("Error".to_string(), first.to_string()),
    };
    EngineError::Runtime {
        error_type,
        message: text,
        line: wrap::line_from_stack(message, source_lines),
    }
}

fn is_error_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.ends_with("Error")
}
