//! Process Runner -- argument-vector invocation of external dump tools.
//!
//! Never goes through a shell. Secrets reach the child through environment
//! variables (never logged) or through arguments explicitly marked secret,
//! which are masked in every rendered command line. A watchdog enforces the
//! per-invocation timeout: SIGTERM first, SIGKILL after a grace period.

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BackupError, ExecutionLog};

/// One argument of a command line.
#[derive(Clone)]
pub enum Arg {
    Plain(String),
    /// Passed to the child verbatim, rendered as `display` everywhere else.
    Secret { value: String, display: String },
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Plain(s) => write!(f, "{s:?}"),
            Arg::Secret { display, .. } => write!(f, "{display:?}"),
        }
    }
}

/// Where the child's stdout goes.
#[derive(Debug, Clone)]
pub enum StdoutTarget {
    /// Captured and returned in [`ProcessOutput::stdout`].
    Capture,
    /// Written straight into a file (for tools without an output flag).
    File(PathBuf),
}

/// A fully described external tool invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<Arg>,
    envs: Vec<(String, String)>,
    stdout: StdoutTarget,
    timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdout: StdoutTarget::Capture,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Plain(arg.into()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|a| Arg::Plain(a.into())));
        self
    }

    /// An argument whose real value must never be logged.
    pub fn secret_arg(mut self, value: impl Into<String>, display: impl Into<String>) -> Self {
        self.args.push(Arg::Secret {
            value: value.into(),
            display: display.into(),
        });
        self
    }

    /// Environment variable for the child. Values are never rendered.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = StdoutTarget::File(path.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The real argument vector handed to the child.
    pub fn argv(&self) -> Vec<&str> {
        self.args
            .iter()
            .map(|a| match a {
                Arg::Plain(s) => s.as_str(),
                Arg::Secret { value, .. } => value.as_str(),
            })
            .collect()
    }

    /// Loggable rendering: secret arguments masked, env values omitted.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            match arg {
                Arg::Plain(s) => out.push_str(s),
                Arg::Secret { display, .. } => out.push_str(display),
            }
        }
        if !self.envs.is_empty() {
            let names: Vec<&str> = self.envs.iter().map(|(k, _)| k.as_str()).collect();
            out.push_str(&format!(" [env: {}]", names.join(", ")));
        }
        out
    }
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    /// Empty when stdout went to a file.
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    kill_grace: Duration,
}

impl ProcessRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Run `spec`, appending the rendered invocation and stderr to `log`.
    ///
    /// Non-zero exit becomes [`BackupError::Execution`], an overrun becomes
    /// [`BackupError::Timeout`]; both carry a copy of `log`.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        log: &mut ExecutionLog,
    ) -> Result<ProcessOutput, BackupError> {
        log.push(format!("$ {}", spec.display()));
        info!(program = %spec.program, command = %spec.display(), "starting external tool");

        let stdout = match &spec.stdout {
            StdoutTarget::Capture => Stdio::piped(),
            StdoutTarget::File(path) => {
                let file = std::fs::File::create(path).map_err(|e| {
                    self.fail(
                        log,
                        format!("cannot create output file {}: {e}", path.display()),
                    )
                })?;
                Stdio::from(file)
            }
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(spec.argv())
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| self.fail(log, format!("failed to spawn '{}': {e}", spec.program)))?;

        let stdout_reader = child.stdout.take().map(drain);
        let stderr_reader = child.stderr.take().map(drain);

        let waited = tokio::time::timeout(spec.timeout, child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(self.fail(log, format!("failed to wait for '{}': {e}", spec.program)));
            }
            Err(_) => {
                warn!(
                    program = %spec.program,
                    timeout_secs = spec.timeout.as_secs(),
                    "external tool timed out, terminating"
                );
                terminate_child(&mut child, self.kill_grace).await;
                // Grandchildren may still hold the pipe open.
                let stderr = tokio::time::timeout(self.kill_grace, collect(stderr_reader))
                    .await
                    .unwrap_or_default();
                log.push_output("stderr", &stderr);
                log.push(format!(
                    "{} killed after exceeding timeout of {}s",
                    spec.program,
                    spec.timeout.as_secs()
                ));
                return Err(BackupError::Timeout {
                    program: spec.program.clone(),
                    timeout: spec.timeout,
                    log: log.clone(),
                });
            }
        };

        let stdout = collect(stdout_reader).await;
        let stderr = collect(stderr_reader).await;
        let elapsed = start.elapsed();
        log.push_output("stderr", &stderr);

        debug!(
            program = %spec.program,
            exit_code = status.code(),
            elapsed_ms = elapsed.as_millis() as u64,
            "external tool exited"
        );

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let summary = stderr.lines().last().unwrap_or("").trim();
            let mut message = format!("{} exited with code {code}", spec.program);
            if !summary.is_empty() {
                message.push_str(&format!(": {summary}"));
            }
            return Err(self.fail(log, message));
        }

        log.push(format!(
            "{} finished in {:.1}s",
            spec.program,
            elapsed.as_secs_f64()
        ));

        Ok(ProcessOutput {
            status,
            stdout,
            stderr,
            elapsed,
        })
    }

    fn fail(&self, log: &mut ExecutionLog, message: String) -> BackupError {
        log.push(&message);
        BackupError::Execution {
            message,
            log: log.clone(),
        }
    }
}

fn drain<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!(error = %e, "error reading child pipe");
        }
        buf
    })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    match handle {
        Some(h) => match h.await {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(_) => String::new(),
        },
        None => String::new(),
    }
}

/// Gracefully terminate a child process.
///
/// Sends SIGTERM first, waits up to `grace`, then sends SIGKILL if the
/// process is still running.
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "child exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for child after SIGTERM");
        }
        Err(_) => {
            warn!("child did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL child");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Duration::from_millis(500))
    }

    #[test]
    fn test_display_masks_secrets_and_env_values() {
        let spec = CommandSpec::new("mongodump", Duration::from_secs(5))
            .secret_arg("--uri=mongodb://u:hunter2@h/db", "--uri=mongodb://u:****@h/db")
            .arg("--out=/tmp/x")
            .env("PGPASSWORD", "hunter2");

        let shown = spec.display();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("--uri=mongodb://u:****@h/db"));
        assert!(shown.contains("[env: PGPASSWORD]"));
        assert_eq!(spec.argv()[0], "--uri=mongodb://u:hunter2@h/db");
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let spec = CommandSpec::new("sh", Duration::from_secs(5))
            .arg("-c")
            .arg("echo out; echo warn >&2");
        let mut log = ExecutionLog::new();
        let out = runner().run(&spec, &mut log).await.unwrap();
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "warn");
        assert!(log.to_string().contains("stderr: warn"));
    }

    #[tokio::test]
    async fn test_env_reaches_child_but_not_log() {
        let dir = tempfile::tempdir().unwrap();
        let out_file = dir.path().join("out.txt");
        let spec = CommandSpec::new("sh", Duration::from_secs(5))
            .arg("-c")
            .arg("printf %s \"$SECRET_PW\"")
            .env("SECRET_PW", "hunter2")
            .stdout_to(&out_file);
        let mut log = ExecutionLog::new();
        let out = runner().run(&spec, &mut log).await.unwrap();
        assert!(out.stdout.is_empty());
        assert_eq!(std::fs::read_to_string(&out_file).unwrap(), "hunter2");
        assert!(!log.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_execution_error_with_log() {
        let spec = CommandSpec::new("sh", Duration::from_secs(5))
            .arg("-c")
            .arg("echo 'access denied' >&2; exit 3");
        let mut log = ExecutionLog::new();
        let err = runner().run(&spec, &mut log).await.unwrap_err();
        match &err {
            BackupError::Execution { message, log } => {
                assert!(message.contains("code 3"));
                assert!(message.contains("access denied"));
                assert!(log.to_string().contains("stderr: access denied"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_binary_is_execution_error() {
        let spec = CommandSpec::new("/nonexistent/pg_dump", Duration::from_secs(5));
        let mut log = ExecutionLog::new();
        let err = runner().run(&spec, &mut log).await.unwrap_err();
        assert!(matches!(err, BackupError::Execution { .. }));
    }

    #[tokio::test]
    async fn test_timeout_terminates_child() {
        let spec = CommandSpec::new("sleep", Duration::from_millis(200)).arg("30");
        let mut log = ExecutionLog::new();
        let start = Instant::now();
        let err = runner().run(&spec, &mut log).await.unwrap_err();
        assert!(matches!(err, BackupError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(err.log().to_string().contains("killed after exceeding timeout"));
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_sigkill() {
        let spec = CommandSpec::new("sh", Duration::from_millis(200))
            .arg("-c")
            .arg("trap '' TERM; sleep 30");
        let mut log = ExecutionLog::new();
        let start = Instant::now();
        let err = runner().run(&spec, &mut log).await.unwrap_err();
        assert!(matches!(err, BackupError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
