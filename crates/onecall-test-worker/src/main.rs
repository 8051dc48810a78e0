//! A worker process for process-level tests.
//!
//! Launched as `onecall-test-worker <module path>`, it prints the ready
//! handshake and then answers one request per line until stdin closes.
//! The module path is only logged; the functions are built in:
//!
//! | function  | behavior |
//! |-----------|----------|
//! | `echo`    | returns its kwargs |
//! | `add`     | returns `a + b` |
//! | `sleep`   | sleeps `ms` milliseconds, returns `ms` |
//! | `pid`     | returns the process id |
//! | `env`     | returns the environment variable `name`, or `null` |
//! | `context` | returns the config and secrets it received |
//! | `fail`    | reports an error and keeps serving |
//! | `crash`   | exits with status 3 without replying |

use std::time::Duration;

use anyhow::{Context, Result};
use onecall_engine::ipc::{
    read_message, write_line, CallRequest, CallResponse, Handshake, DEFAULT_MAX_LINE_SIZE,
};
use serde_json::{json, Value};
use tokio::io::{self, BufReader};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let module = std::env::args().nth(1).unwrap_or_default();
    tracing::info!(module = %module, pid = std::process::id(), "test worker starting");

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    write_line(&mut stdout, &Handshake { ready: true })
        .await
        .context("failed to write handshake")?;

    while let Some(request) = read_message::<CallRequest, _>(&mut stdin, DEFAULT_MAX_LINE_SIZE)
        .await
        .context("failed to read request")?
    {
        tracing::debug!(function = %request.function, "request");
        let response = match handle(&request).await {
            Some(response) => response,
            None => std::process::exit(3),
        };
        write_line(&mut stdout, &response)
            .await
            .context("failed to write response")?;
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}

/// `None` means the worker should die without answering.
async fn handle(request: &CallRequest) -> Option<CallResponse> {
    let kwargs = &request.kwargs;
    let response = match request.function.as_str() {
        "echo" => CallResponse::ok(Value::Object(kwargs.clone())),
        "add" => match (
            kwargs.get("a").and_then(Value::as_f64),
            kwargs.get("b").and_then(Value::as_f64),
        ) {
            (Some(a), Some(b)) => CallResponse::ok(json!(a + b)),
            _ => CallResponse::err("add needs numeric 'a' and 'b'"),
        },
        "sleep" => {
            let ms = kwargs.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            CallResponse::ok(json!(ms))
        }
        "pid" => CallResponse::ok(json!(std::process::id())),
        "env" => {
            let name = kwargs.get("name").and_then(Value::as_str).unwrap_or_default();
            CallResponse::ok(std::env::var(name).map(Value::String).unwrap_or(Value::Null))
        }
        "context" => CallResponse::ok(json!({
            "config": request.config,
            "secrets": request.secrets,
        })),
        "fail" => CallResponse::err("deliberate failure"),
        "crash" => return None,
        other => CallResponse::err(format!("unknown function '{other}'")),
    };
    Some(response)
}
