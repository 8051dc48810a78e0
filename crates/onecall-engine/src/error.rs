//! Error types for the command engine.

use onecall_error::{structured, LookupError};
use serde_json::Value;
use thiserror::Error;

/// Errors that stop a command.
///
/// Every variant maps to a stable [`code()`](EngineError::code) and renders
/// as a structured JSON error through
/// [`to_structured_error()`](EngineError::to_structured_error).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The source could not be parsed.
    #[error("Syntax error at line {line}: {message}")]
    Syntax {
        /// 1-based line in the submitted source.
        line: usize,
        /// Parser message.
        message: String,
    },

    /// The validator rejected the source.
    #[error("validation failed: {}", .errors.join("; "))]
    Security {
        /// Every error reported by the validator, in order.
        errors: Vec<String>,
    },

    /// A namespace or function reference did not resolve.
    #[error("line {line}: {error}")]
    Resolution {
        /// 1-based line of the reference.
        line: usize,
        /// The lookup failure with the known alternatives.
        #[source]
        error: LookupError,
    },

    /// A snippet name did not resolve.
    #[error("unknown snippet '@{name}'; available snippets: {}", list(.known))]
    UnknownSnippet {
        /// The requested snippet.
        name: String,
        /// Every configured snippet.
        known: Vec<String>,
    },

    /// Call arguments do not match the parameter schema.
    #[error("{}{message} (expected {signature})", line_prefix(.line))]
    Argument {
        /// 1-based line of the call, when known.
        line: Option<usize>,
        /// What is wrong with the arguments.
        message: String,
        /// The expected signature.
        signature: String,
    },

    /// An uncaught exception during execution.
    #[error("{error_type}{}: {message}", line_suffix(.line))]
    Runtime {
        /// JavaScript error class, e.g. `TypeError`.
        error_type: String,
        /// Error message.
        message: String,
        /// 1-based line in the submitted source, when known.
        line: Option<usize>,
    },

    /// An uncaught failure raised by a capability call.
    #[error("{kind}{}: {message}", line_suffix(.line))]
    Capability {
        /// Error class seen by agent code, e.g. `WorkerUnavailableError`.
        kind: String,
        /// Stable code of the underlying call error.
        code: String,
        /// Error message.
        message: String,
        /// 1-based line of the failing call, when known.
        line: Option<usize>,
        /// Whether retrying the command may succeed.
        retryable: bool,
    },

    /// Execution exceeded the wall-clock limit.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Too many commands are executing at once.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum concurrent executions.
        max: usize,
    },

    /// Source exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// Brackets nest deeper than the validator accepts.
    #[error("nesting depth {actual} exceeds maximum {max}")]
    NestingTooDeep {
        /// Maximum accepted depth.
        max: usize,
        /// Depth found in the source.
        actual: usize,
    },

    /// The rendered result exceeds the configured maximum size.
    #[error("output exceeds maximum size of {max} bytes")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// Generic execution failure.
    #[error("execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Result serialization failed.
    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn list(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

fn line_prefix(line: &Option<usize>) -> String {
    line.map(|l| format!("line {l}: ")).unwrap_or_default()
}

fn line_suffix(line: &Option<usize>) -> String {
    line.map(|l| format!(" at line {l}")).unwrap_or_default()
}

impl EngineError {
    /// Returns a stable error code string for programmatic matching.
    pub fn code(&self) -> &str {
        match self {
            Self::Syntax { .. } => "SYNTAX_ERROR",
            Self::Security { .. } => "SECURITY_ERROR",
            Self::Resolution { .. } | Self::UnknownSnippet { .. } => "RESOLUTION_ERROR",
            Self::Argument { .. } => "ARGUMENT_ERROR",
            Self::Runtime { .. } => "RUNTIME_ERROR",
            Self::Capability { code, .. } => code,
            Self::Timeout { .. } => "TIMEOUT",
            Self::ConcurrencyLimit { .. } => "CONCURRENCY_LIMIT",
            Self::CodeTooLarge { .. }
            | Self::NestingTooDeep { .. }
            | Self::OutputTooLarge { .. }
            | Self::HeapLimitExceeded => "LIMIT_EXCEEDED",
            Self::Execution(_) | Self::Serialization(_) => "INTERNAL",
        }
    }

    /// Returns whether the same command may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Capability { retryable, .. } => *retryable,
            Self::Timeout { .. } | Self::ConcurrencyLimit { .. } => true,
            _ => false,
        }
    }

    /// The 1-based source line the error refers to, if any.
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::Syntax { line, .. } | Self::Resolution { line, .. } => Some(*line),
            Self::Argument { line, .. }
            | Self::Runtime { line, .. }
            | Self::Capability { line, .. } => *line,
            _ => None,
        }
    }

    /// Convert to a structured JSON error response for LLM consumption.
    pub fn to_structured_error(&self) -> Value {
        let suggested_fix = match self {
            Self::Syntax { .. } => Some("Fix the syntax error and resubmit".to_string()),
            Self::Security { .. } => Some(
                "Remove the blocked constructs; call registered functions as namespace.function(...) instead"
                    .to_string(),
            ),
            Self::Resolution { error, .. } => error
                .suggestion()
                .or_else(|| Some("Call meta.namespaces() to list what is available".to_string())),
            Self::UnknownSnippet { known, name } => {
                onecall_error::find_similar(name, known.iter().map(String::as_str))
                    .map(|s| format!("Did you mean '@{s}'?"))
            }
            Self::Argument { signature, .. } => Some(format!("Call it as {signature}")),
            Self::Capability { retryable: true, .. } => {
                Some("Retry the command; failed workers are restarted automatically".to_string())
            }
            Self::Timeout { .. } => {
                Some("Reduce the work done in one command or split it up".to_string())
            }
            Self::ConcurrencyLimit { .. } => Some("Retry shortly".to_string()),
            Self::CodeTooLarge { .. } => Some("Submit a shorter command".to_string()),
            Self::NestingTooDeep { .. } => {
                Some("Flatten the code, e.g. with intermediate variables".to_string())
            }
            Self::OutputTooLarge { .. } => {
                Some("Return a smaller value, e.g. a summary or a slice".to_string())
            }
            Self::HeapLimitExceeded => Some("Process the data in smaller pieces".to_string()),
            _ => None,
        };
        let mut value = structured(self.code(), &self.to_string(), self.retryable(), suggested_fix);
        if let Some(line) = self.line() {
            value["line"] = Value::from(line);
        }
        if let Self::Security { errors } = self {
            value["errors"] = Value::from(errors.clone());
        }
        if let Self::Resolution { error, .. } = self {
            value["alternatives"] = Value::from(error.alternatives().to_vec());
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let syntax = EngineError::Syntax {
            line: 3,
            message: "Unexpected token".into(),
        };
        assert_eq!(syntax.code(), "SYNTAX_ERROR");
        assert_eq!(syntax.to_string(), "Syntax error at line 3: Unexpected token");
        assert_eq!(EngineError::HeapLimitExceeded.code(), "LIMIT_EXCEEDED");
        assert_eq!(EngineError::Timeout { timeout_ms: 10 }.code(), "TIMEOUT");
    }

    #[test]
    fn resolution_error_carries_alternatives() {
        let err = EngineError::Resolution {
            line: 1,
            error: LookupError::UnknownNamespace {
                namespace: "wbe".into(),
                known: vec!["meta".into(), "web".into()],
            },
        };
        assert_eq!(err.code(), "RESOLUTION_ERROR");
        let json = err.to_structured_error();
        assert_eq!(json["alternatives"], serde_json::json!(["meta", "web"]));
        assert_eq!(json["suggested_fix"], "Did you mean namespace 'web'?");
        assert_eq!(json["line"], 1);
    }

    #[test]
    fn capability_error_keeps_call_code() {
        let err = EngineError::Capability {
            kind: "WorkerUnavailableError".into(),
            code: "WORKER_UNAVAILABLE".into(),
            message: "worker exited".into(),
            line: Some(2),
            retryable: true,
        };
        assert_eq!(err.code(), "WORKER_UNAVAILABLE");
        assert!(err.retryable());
        assert_eq!(err.to_string(), "WorkerUnavailableError at line 2: worker exited");
    }

    #[test]
    fn argument_error_mentions_signature() {
        let err = EngineError::Argument {
            line: Some(4),
            message: "missing required argument 'query'".into(),
            signature: "web.search(query, limit=10)".into(),
        };
        assert_eq!(
            err.to_string(),
            "line 4: missing required argument 'query' (expected web.search(query, limit=10))"
        );
    }

    #[test]
    fn security_error_lists_every_error() {
        let err = EngineError::Security {
            errors: vec!["a".into(), "b".into()],
        };
        let json = err.to_structured_error();
        assert_eq!(json["errors"], serde_json::json!(["a", "b"]));
        assert_eq!(json["retryable"], false);
    }
}
