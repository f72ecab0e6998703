//! Backup error taxonomy and the execution log carried by every error.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ordered, timestamped lines describing what a backup attempt did.
///
/// Stored verbatim in the `execution_log` column of a history entry and
/// attached to every [`BackupError`] so operators can see which step failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionLog {
    lines: Vec<String>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line, prefixed with the current UTC time.
    pub fn push(&mut self, line: impl AsRef<str>) {
        let ts = Utc::now().format("%H:%M:%S%.3f");
        self.lines.push(format!("[{ts}] {}", line.as_ref()));
    }

    /// Append captured tool output, one log line per non-empty output line.
    pub fn push_output(&mut self, label: &str, output: &str) {
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            self.push(format!("{label}: {line}"));
        }
    }

    /// Move all lines of `other` to the end of this log.
    pub fn append(&mut self, other: &mut ExecutionLog) {
        self.lines.append(&mut other.lines);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl fmt::Display for ExecutionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lines.join("\n"))
    }
}

#[derive(Debug, Error)]
pub enum BackupError {
    /// Missing or invalid source/destination fields. Never retried.
    #[error("configuration error: {message}")]
    Configuration { message: String, log: ExecutionLog },

    /// External tool failed or produced no usable output.
    #[error("execution failed: {message}")]
    Execution { message: String, log: ExecutionLog },

    /// The process runner's watchdog fired.
    #[error("{program} timed out after {}s", timeout.as_secs())]
    Timeout {
        program: String,
        timeout: Duration,
        log: ExecutionLog,
    },

    /// Missing credential provider or undecryptable secret.
    #[error("credential resolution failed: {message}")]
    Credential { message: String, log: ExecutionLog },

    #[error("upload failed: {message}")]
    Upload { message: String, log: ExecutionLog },

    #[error("copy failed: {message}")]
    Copy { message: String, log: ExecutionLog },
}

impl BackupError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            log: ExecutionLog::new(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            log: ExecutionLog::new(),
        }
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential {
            message: message.into(),
            log: ExecutionLog::new(),
        }
    }

    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload {
            message: message.into(),
            log: ExecutionLog::new(),
        }
    }

    pub fn copy(message: impl Into<String>) -> Self {
        Self::Copy {
            message: message.into(),
            log: ExecutionLog::new(),
        }
    }

    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Execution { .. } => "execution",
            Self::Timeout { .. } => "timeout",
            Self::Credential { .. } => "credential",
            Self::Upload { .. } => "upload",
            Self::Copy { .. } => "copy",
        }
    }

    /// Only attempt-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution { .. } | Self::Timeout { .. })
    }

    pub fn log(&self) -> &ExecutionLog {
        match self {
            Self::Configuration { log, .. }
            | Self::Execution { log, .. }
            | Self::Timeout { log, .. }
            | Self::Credential { log, .. }
            | Self::Upload { log, .. }
            | Self::Copy { log, .. } => log,
        }
    }

    fn log_mut(&mut self) -> &mut ExecutionLog {
        match self {
            Self::Configuration { log, .. }
            | Self::Execution { log, .. }
            | Self::Timeout { log, .. }
            | Self::Credential { log, .. }
            | Self::Upload { log, .. }
            | Self::Copy { log, .. } => log,
        }
    }

    /// Prefix the error's own log with the log accumulated before it was raised.
    ///
    /// The error message itself is appended as the final line.
    pub fn with_log(mut self, mut accumulated: ExecutionLog) -> Self {
        let message = self.to_string();
        let own = self.log_mut();
        accumulated.append(own);
        accumulated.push(format!("ERROR {message}"));
        *own = accumulated;
        self
    }
}
