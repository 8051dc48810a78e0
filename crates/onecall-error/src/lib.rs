//! Typed error types shared across the onecall crates.
//!
//! Provides [`CallError`], the canonical error for a single capability
//! call (in-process or worker-backed), and [`LookupError`], the typed
//! "not found" result of a registry lookup that carries the alternatives
//! an agent can pick from instead.

use thiserror::Error;

/// Canonical error type for a capability call.
///
/// Marked `#[non_exhaustive]` to allow future additions without breaking
/// downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CallError {
    /// The keyword arguments did not match the function's parameter schema.
    #[error("invalid arguments for {function}: {message} (expected {signature})")]
    InvalidArguments {
        /// Qualified name of the function.
        function: String,
        /// What was wrong with the arguments.
        message: String,
        /// The expected signature, e.g. `web.search(query, limit=10)`.
        signature: String,
    },

    /// The capability ran and reported a failure.
    #[error("{function} failed: {message}")]
    Failed {
        /// Qualified name of the function.
        function: String,
        /// The error message reported by the capability.
        message: String,
    },

    /// The worker process hosting the capability could not serve the call.
    #[error("worker for '{module}' unavailable: {reason}")]
    WorkerUnavailable {
        /// Source path of the worker module.
        module: String,
        /// Why the worker could not serve the call.
        reason: String,
    },

    /// The call did not complete in time.
    #[error("{function} timed out after {timeout_ms}ms")]
    Timeout {
        /// Qualified name of the function.
        function: String,
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A per-command call budget was exhausted.
    #[error("call limit exceeded: {0}")]
    LimitExceeded(String),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CallError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArguments { .. } => "ARGUMENT_ERROR",
            Self::Failed { .. } => "CAPABILITY_ERROR",
            Self::WorkerUnavailable { .. } => "WORKER_UNAVAILABLE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::LimitExceeded(_) => "LIMIT_EXCEEDED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// The error class name seen by agent code when this error is thrown
    /// into the JavaScript runtime.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArguments { .. } => "ArgumentError",
            Self::Failed { .. } => "CapabilityError",
            Self::WorkerUnavailable { .. } => "WorkerUnavailableError",
            Self::Timeout { .. } => "TimeoutError",
            Self::LimitExceeded(_) => "LimitError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Returns whether the call may succeed if retried.
    ///
    /// A failed worker is replaced on the next call, so a
    /// `WorkerUnavailable` call is worth retrying by the caller.
    pub fn retryable(&self) -> bool {
        match self {
            Self::WorkerUnavailable { .. } => true,
            Self::Timeout { .. } => true,
            Self::InvalidArguments { .. } => false,
            Self::Failed { .. } => false,
            Self::LimitExceeded(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// Convert to a structured JSON error response for LLM consumption.
    pub fn to_structured_error(&self) -> serde_json::Value {
        let suggested_fix = match self {
            Self::InvalidArguments { signature, .. } => Some(format!("Call it as {signature}")),
            Self::WorkerUnavailable { .. } => {
                Some("Retry the call; the worker is restarted automatically".to_string())
            }
            Self::Timeout { .. } => Some("Retry with a smaller request".to_string()),
            Self::LimitExceeded(_) => Some("Split the work across several commands".to_string()),
            _ => None,
        };
        structured(self.code(), &self.to_string(), self.retryable(), suggested_fix)
    }
}

/// Typed "not found" result of a two-level registry lookup.
///
/// Every variant carries the set of names that *do* exist so the message
/// can enumerate them for the agent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum LookupError {
    /// No namespace with this name is registered.
    #[error("unknown namespace '{namespace}'; available namespaces: {}", list(.known))]
    UnknownNamespace {
        /// The namespace that was requested.
        namespace: String,
        /// All registered namespaces.
        known: Vec<String>,
    },

    /// The namespace exists but has no function with this name.
    #[error(
        "unknown function '{function}' in namespace '{namespace}'; available functions: {}",
        list(.known)
    )]
    UnknownFunction {
        /// The namespace that was searched.
        namespace: String,
        /// The function that was requested.
        function: String,
        /// All functions registered in the namespace.
        known: Vec<String>,
    },

    /// The name is not of the form `namespace.function`.
    #[error("'{0}' is not a qualified name (expected namespace.function)")]
    NotQualified(String),
}

impl LookupError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        "RESOLUTION_ERROR"
    }

    /// The alternatives a caller could have used instead.
    pub fn alternatives(&self) -> &[String] {
        match self {
            Self::UnknownNamespace { known, .. } | Self::UnknownFunction { known, .. } => known,
            Self::NotQualified(_) => &[],
        }
    }

    /// A "did you mean" hint when an alternative is within a small edit
    /// distance of the requested name.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::UnknownNamespace { namespace, known } => {
                find_similar(namespace, known.iter().map(String::as_str))
                    .map(|s| format!("Did you mean namespace '{s}'?"))
            }
            Self::UnknownFunction {
                namespace,
                function,
                known,
            } => find_similar(function, known.iter().map(String::as_str))
                .map(|s| format!("Did you mean '{namespace}.{s}'?")),
            Self::NotQualified(_) => None,
        }
    }

    /// Convert to a structured JSON error response for LLM consumption.
    pub fn to_structured_error(&self) -> serde_json::Value {
        structured(self.code(), &self.to_string(), false, self.suggestion())
    }
}

/// Build the structured error object shared by every error in the
/// workspace: `error`, `code`, `message`, `retryable` and optionally
/// `suggested_fix`.
pub fn structured(
    code: &str,
    message: &str,
    retryable: bool,
    suggested_fix: Option<String>,
) -> serde_json::Value {
    let mut obj = serde_json::json!({
        "error": true,
        "code": code,
        "message": message,
        "retryable": retryable,
    });
    if let Some(fix) = suggested_fix {
        obj["suggested_fix"] = serde_json::Value::String(fix);
    }
    obj
}

/// Find the closest candidate using Levenshtein distance.
///
/// Returns `None` unless a candidate is within edit distance 3.
pub fn find_similar<'a>(name: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let mut best: Option<(usize, &'a str)> = None;
    for candidate in candidates {
        let dist = strsim::levenshtein(name, candidate);
        if dist <= 3 && best.is_none_or(|(d, _)| dist < d) {
            best = Some((dist, candidate));
        }
    }
    best.map(|(_, candidate)| candidate)
}

fn list(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

// Compile-time assertion: both error types must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<CallError>();
    assert_bounds::<LookupError>();
};
