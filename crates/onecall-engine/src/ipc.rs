//! Wire protocol between the pool and a worker process.
//!
//! One JSON object per line over the worker's stdin/stdout:
//!
//! ```text
//! worker -> host   {"ready": true}
//! host -> worker   {"function": "search", "kwargs": {...}, "config": {...}, "secrets": {...}}
//! worker -> host   {"result": ...}            or   {"error": "message"}
//! ```
//!
//! A response whose `error` is a non-null string is an error. Otherwise it
//! must carry a `result` key, which may be `null`. Anything else is
//! malformed.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum line size: 8 MiB.
pub const DEFAULT_MAX_LINE_SIZE: usize = 8 * 1024 * 1024;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Reading or writing the pipe failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A line exceeded the size limit.
    #[error("line exceeds {max} bytes")]
    LineTooLong {
        /// The limit in bytes.
        max: usize,
    },

    /// A line was not a valid message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The worker closed its stdout.
    #[error("worker closed the connection")]
    Closed,
}

impl ProtocolError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "IO",
            Self::LineTooLong { .. } => "LINE_TOO_LONG",
            Self::Malformed(_) => "MALFORMED",
            Self::Closed => "CLOSED",
        }
    }
}

/// One call sent to a worker.
#[derive(Clone, Serialize, Deserialize)]
pub struct CallRequest {
    /// Function short name within the module.
    pub function: String,
    /// Bound keyword arguments.
    pub kwargs: Map<String, Value>,
    /// Configuration snapshot.
    pub config: Map<String, Value>,
    /// Secret snapshot.
    pub secrets: Map<String, Value>,
}

impl fmt::Debug for CallRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secret_keys: Vec<&String> = self.secrets.keys().collect();
        f.debug_struct("CallRequest")
            .field("function", &self.function)
            .field("kwargs", &self.kwargs)
            .field("config", &self.config)
            .field("secrets", &format_args!("{secret_keys:?} (redacted)"))
            .finish()
    }
}

/// One response read from a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    /// The value. `Some(Value::Null)` when the key is present with `null`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    /// The error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl CallResponse {
    /// A successful response.
    pub fn ok(value: Value) -> Self {
        Self {
            result: Some(value),
            error: None,
        }
    }

    /// A failed response.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }

    /// Exactly one of a value or an error message.
    pub fn into_result(self) -> Result<Result<Value, String>, ProtocolError> {
        match (self.result, self.error) {
            (None | Some(Value::Null), Some(error)) => Ok(Err(error)),
            (Some(value), None) => Ok(Ok(value)),
            (Some(_), Some(_)) => Err(ProtocolError::Malformed(
                "response carries both a result and an error".into(),
            )),
            (None, None) => Err(ProtocolError::Malformed(
                "response carries neither a result nor an error".into(),
            )),
        }
    }
}

/// The line a worker prints once it can accept requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Must be `true`.
    pub ready: bool,
}

/// Write one message as a JSON line and flush.
pub async fn write_line<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), ProtocolError> {
    let mut payload =
        serde_json::to_vec(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one raw line without its terminator.
///
/// Returns `None` at EOF. Blank lines are skipped.
pub async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<String>, ProtocolError> {
    loop {
        let mut buf = Vec::new();
        let limit = u64::try_from(max_size).unwrap_or(u64::MAX).saturating_add(1);
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        if buf.len() > max_size {
            return Err(ProtocolError::LineTooLong { max: max_size });
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return String::from_utf8(buf)
            .map(Some)
            .map_err(|e| ProtocolError::Malformed(e.to_string()));
    }
}

/// Read and decode one message. Returns `None` at EOF.
pub async fn read_message<T: DeserializeOwned, R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, ProtocolError> {
    let Some(line) = read_line(reader, max_size).await? else {
        return Ok(None);
    };
    serde_json::from_str(&line)
        .map(Some)
        .map_err(|e| ProtocolError::Malformed(format!("{e}: {}", preview(&line))))
}

fn preview(line: &str) -> String {
    const MAX: usize = 120;
    if line.len() <= MAX {
        return line.to_string();
    }
    let mut end = MAX;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &line[..end])
}
