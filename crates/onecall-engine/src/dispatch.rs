//! Routing a capability call to its implementation.

use std::sync::Arc;
use std::time::Instant;

use onecall_registry::{CallError, Isolation, Registry};
use serde_json::{Map, Value};

use crate::pool::WorkerPool;

/// Routes calls by isolation kind against one registry snapshot.
///
/// A command holds a single dispatcher for its whole run, so every call it
/// makes sees the same registry table even if a reload lands mid-command.
pub struct Dispatcher {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
}

impl Dispatcher {
    /// A dispatcher over `registry` using `pool` for worker-backed entries.
    pub fn new(registry: Arc<Registry>, pool: Arc<WorkerPool>) -> Self {
        Self { registry, pool }
    }

    /// The registry snapshot calls are resolved against.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Bind `kwargs` to the schema of `qualified` and run it.
    #[tracing::instrument(skip(self, kwargs))]
    pub async fn invoke(&self, qualified: &str, kwargs: Map<String, Value>) -> Result<Value, CallError> {
        let entry = self
            .registry
            .lookup(qualified)
            .map_err(|e| CallError::Internal(e.into()))?;
        let args = entry.bind(kwargs)?;
        let ctx = entry
            .context(self.registry.values())
            .with_registry(self.registry.clone());
        let started = Instant::now();

        let result = match &entry.isolation {
            Isolation::InProcess(capability) => capability.call(args, &ctx).await,
            Isolation::Worker(spec) => self
                .pool
                .call(spec, &entry.name, args, ctx.config, ctx.secrets)
                .await
                .map_err(|e| qualify(e, qualified)),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::debug!(isolation = entry.isolation.kind(), elapsed_ms, "call complete"),
            Err(e) => tracing::debug!(
                isolation = entry.isolation.kind(),
                elapsed_ms,
                code = e.code(),
                error = %e,
                "call failed"
            ),
        }
        result
    }
}

/// Worker errors name the function by its short name; report the
/// qualified one.
fn qualify(err: CallError, qualified: &str) -> CallError {
    match err {
        CallError::Failed { message, .. } => CallError::Failed {
            function: qualified.to_string(),
            message,
        },
        CallError::Timeout { timeout_ms, .. } => CallError::Timeout {
            function: qualified.to_string(),
            timeout_ms,
        },
        other => other,
    }
}
