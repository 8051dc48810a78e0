//! deno_core op definitions for the command runtime.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; the ops and state types below are documented.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use onecall_registry::CallError;
use serde_json::{json, Map, Value};

use crate::dispatch::Dispatcher;

/// Per-command call budget.
pub struct CallBudget {
    /// Maximum capability calls in one command.
    pub max_calls: usize,
    /// Maximum size of the serialized keyword arguments of one call.
    pub max_args_size: usize,
    /// Calls made so far.
    pub calls_made: usize,
}

/// The runtime capability calls are executed on. The V8 thread only waits
/// for them.
pub struct CallRuntime(pub tokio::runtime::Handle);

/// Wrapper for the command outcome stored in OpState.
pub struct ExecutionResult(pub String);

/// Log a message from command code at the given console level.
#[op2(fast)]
pub fn op_onecall_log(#[string] level: &str, #[string] msg: &str) {
    match level {
        "error" => tracing::error!(target: "onecall::engine::js", "{}", msg),
        "warn" => tracing::warn!(target: "onecall::engine::js", "{}", msg),
        "debug" => tracing::debug!(target: "onecall::engine::js", "{}", msg),
        _ => tracing::info!(target: "onecall::engine::js", "{}", msg),
    }
}

/// Store the command outcome in OpState.
#[op2(fast)]
pub fn op_onecall_set_result(state: &mut OpState, #[string] json: &str) {
    state.put(ExecutionResult(json.to_string()));
}

/// Invoke a registered function.
///
/// Always resolves to an envelope: `{"ok": value}` or
/// `{"error": {kind, code, message, target, retryable}}`. The bootstrap
/// turns an error envelope into a thrown exception carrying the same
/// fields.
#[op2(async)]
#[string]
pub async fn op_onecall_invoke(
    op_state: Rc<RefCell<OpState>>,
    #[string] name: String,
    #[string] kwargs_json: String,
) -> Result<String, JsErrorBox> {
    tracing::debug!(function = %name, args_len = kwargs_json.len(), "call dispatched");

    let over_budget = {
        let mut st = op_state.borrow_mut();
        let budget = st.borrow_mut::<CallBudget>();
        if budget.calls_made >= budget.max_calls {
            Some(format!(
                "more than {} calls in one command",
                budget.max_calls
            ))
        } else if kwargs_json.len() > budget.max_args_size {
            Some(format!(
                "arguments of {name} are {} bytes, max {} bytes",
                kwargs_json.len(),
                budget.max_args_size
            ))
        } else {
            budget.calls_made += 1;
            None
        }
    };
    if let Some(reason) = over_budget {
        return envelope(&name, Err(CallError::LimitExceeded(reason)));
    }

    let (dispatcher, handle) = {
        let st = op_state.borrow();
        (
            st.borrow::<Arc<Dispatcher>>().clone(),
            st.borrow::<CallRuntime>().0.clone(),
        )
    };

    let kwargs: Map<String, Value> = match serde_json::from_str(&kwargs_json) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            let err = anyhow::anyhow!("keyword arguments must be an object, got {other}");
            return envelope(&name, Err(CallError::Internal(err)));
        }
        Err(e) => {
            let err = anyhow::anyhow!("invalid keyword arguments: {e}");
            return envelope(&name, Err(CallError::Internal(err)));
        }
    };

    let target = name.clone();
    let mut task = AbortOnDrop(handle.spawn(async move { dispatcher.invoke(&target, kwargs).await }));
    let result = (&mut task.0)
        .await
        .unwrap_or_else(|e| Err(CallError::Internal(anyhow::anyhow!("call task failed: {e}"))));

    envelope(&name, result)
}

/// Aborts the spawned call when the op future is dropped, e.g. when the
/// command times out. The pool then drops the worker mid-exchange, which
/// kills it.
struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn envelope(target: &str, result: Result<Value, CallError>) -> Result<String, JsErrorBox> {
    let body = match result {
        Ok(value) => json!({ "ok": value }),
        Err(e) => json!({
            "error": {
                "kind": e.kind(),
                "code": e.code(),
                "message": e.to_string(),
                "target": target,
                "retryable": e.retryable(),
            }
        }),
    };
    serde_json::to_string(&body)
        .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}")))
}

deno_core::extension!(
    onecall_ext,
    ops = [op_onecall_log, op_onecall_set_result, op_onecall_invoke],
);
