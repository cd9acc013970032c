//! Child process runner with root restriction, timeout and bounded output.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SandboxError;
use crate::sandbox::SandboxConfig;
use crate::tools::builtin::path_utils::normalize_lexical;

/// Outcome of one sandbox run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub timed_out: bool,
    #[serde(rename = "duration_ms", with = "duration_millis")]
    pub duration: Duration,
    /// Bytes dropped from stdout after the capture limit.
    #[serde(default)]
    pub stdout_truncated: usize,
    /// Bytes dropped from stderr after the capture limit.
    #[serde(default)]
    pub stderr_truncated: usize,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Default)]
struct Capture {
    data: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<Capture>>;

fn lock(capture: &SharedCapture) -> MutexGuard<'_, Capture> {
    capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs shell commands on the host under the configured limits.
///
/// Every command goes through `sh -c <command>` exactly as received, so the
/// string the safety classifier inspected is the string that runs. Each
/// child gets its own process group so a timeout or cancellation can kill
/// every descendant, not just the shell.
#[derive(Debug)]
pub struct ExecutionSandbox {
    config: SandboxConfig,
    root: PathBuf,
}

impl ExecutionSandbox {
    /// Create a sandbox; the allowed root must exist.
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let root = config.allowed_root.canonicalize()?;
        Ok(Self { config, root })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Canonical allowed root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `dir` (relative to the root when not absolute) and require it
    /// to stay inside the root after symlinks are followed.
    pub fn resolve_working_dir(&self, dir: Option<&Path>) -> Result<PathBuf, SandboxError> {
        let Some(dir) = dir else {
            return Ok(self.root.clone());
        };

        let joined = if dir.is_absolute() {
            normalize_lexical(dir)
        } else {
            normalize_lexical(&self.root.join(dir))
        };
        let restricted = || SandboxError::PathRestriction {
            path: dir.to_path_buf(),
            root: self.root.clone(),
        };

        if !joined.starts_with(&self.root) {
            return Err(restricted());
        }
        let canonical = joined.canonicalize()?;
        if !canonical.starts_with(&self.root) {
            return Err(restricted());
        }
        Ok(canonical)
    }

    /// Run `command` and capture its result.
    ///
    /// A timeout is reported through `ExecutionResult::timed_out` with any
    /// partial output. Cancellation kills the process group and returns
    /// `SandboxError::Cancelled`.
    pub async fn run(
        &self,
        command: &str,
        working_dir: Option<&Path>,
        timeout: Duration,
        env_overrides: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let cwd = self.resolve_working_dir(working_dir)?;
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        tracing::debug!(
            cwd = %cwd.display(),
            timeout_secs = timeout.as_secs(),
            "Spawning sandboxed command"
        );

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| SandboxError::Spawn {
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let stdout_capture = SharedCapture::default();
        let stderr_capture = SharedCapture::default();
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(drain(
                out,
                stdout_capture.clone(),
                self.config.max_output_bytes,
            )));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(drain(
                err,
                stderr_capture.clone(),
                self.config.max_output_bytes,
            )));
        }

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let (status, timed_out, cancelled) = match outcome {
            Outcome::Exited(status) => (Some(status?), false, false),
            Outcome::TimedOut => {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "Command timed out, killing process group"
                );
                terminate(&mut child, pid).await;
                (child.wait().await.ok(), true, false)
            }
            Outcome::Cancelled => {
                tracing::debug!("Command cancelled, killing process group");
                terminate(&mut child, pid).await;
                (child.wait().await.ok(), false, true)
            }
        };

        let drained = tokio::time::timeout(self.config.drain_grace, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await
        .is_ok();
        if !drained {
            // Some descendant still holds the pipes open.
            terminate(&mut child, pid).await;
            for reader in &readers {
                reader.abort();
            }
        }

        if cancelled {
            return Err(SandboxError::Cancelled);
        }

        let duration = start.elapsed();
        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
        let (stdout, stdout_truncated) = take_capture(&stdout_capture);
        let (stderr, stderr_truncated) = take_capture(&stderr_capture);

        if stdout_truncated > 0 || stderr_truncated > 0 {
            tracing::debug!(stdout_truncated, stderr_truncated, "Command output truncated");
        }
        tracing::debug!(
            exit_code,
            timed_out,
            elapsed_ms = duration.as_millis() as u64,
            "Sandboxed command finished"
        );

        Ok(ExecutionResult {
            stdout,
            stderr,
            exit_code,
            timed_out,
            duration,
            stdout_truncated,
            stderr_truncated,
        })
    }
}

/// Read a stream to EOF, storing at most `limit` bytes and counting the rest.
async fn drain<R: AsyncRead + Unpin>(mut reader: R, capture: SharedCapture, limit: usize) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let mut cap = lock(&capture);
                let keep = limit.saturating_sub(cap.data.len()).min(n);
                cap.data.extend_from_slice(&buf[..keep]);
                cap.truncated += n - keep;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
}

fn take_capture(capture: &SharedCapture) -> (String, usize) {
    let mut cap = lock(capture);
    let data = std::mem::take(&mut cap.data);
    (String::from_utf8_lossy(&data).into_owned(), cap.truncated)
}

/// Kill the child's whole process group, then the child itself.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            let status = Command::new("kill")
                .arg("-9")
                .arg("--")
                .arg(format!("-{pid}"))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = status {
                tracing::debug!(pid, error = %e, "Failed to signal process group");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Child already exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox_in(dir: &Path) -> ExecutionSandbox {
        ExecutionSandbox::new(SandboxConfig::with_root(dir)).unwrap()
    }

    #[tokio::test]
    async fn test_captures_stdout_stderr_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());

        let result = sandbox
            .run(
                "echo out; echo err >&2; exit 3",
                None,
                Duration::from_secs(5),
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert_eq!(result.exit_code, 3);
        assert!(!result.timed_out);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_runs_in_root_with_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let sandbox = sandbox_in(dir.path());

        let result = sandbox
            .run(
                "pwd; echo $GREETING",
                Some(Path::new("sub")),
                Duration::from_secs(5),
                &[("GREETING".to_string(), "hello".to_string())],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut lines = result.stdout.lines();
        let pwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(pwd.canonicalize().unwrap(), sandbox.root().join("sub"));
        assert_eq!(lines.next(), Some("hello"));
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());

        let started = Instant::now();
        let result = sandbox
            .run(
                "echo before; sleep 10",
                None,
                Duration::from_secs(1),
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.stdout.trim(), "before");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());

        let started = Instant::now();
        let result = sandbox
            .run(
                "sleep 10 & sleep 10; wait",
                None,
                Duration::from_secs(1),
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_truncation_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = ExecutionSandbox::new(SandboxConfig {
            max_output_bytes: 10,
            ..SandboxConfig::with_root(dir.path())
        })
        .unwrap();

        let result = sandbox
            .run(
                "printf '0123456789abcdef'",
                None,
                Duration::from_secs(5),
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.stdout, "0123456789");
        assert_eq!(result.stdout_truncated, 6);
    }

    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = sandbox
            .run("sleep 10", None, Duration::from_secs(30), &[], &cancel)
            .await;

        assert!(matches!(result, Err(SandboxError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_working_dir_outside_root_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(dir.path());

        let err = sandbox
            .run(
                "true",
                Some(Path::new("../")),
                Duration::from_secs(5),
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::PathRestriction { .. }));

        let err = sandbox.resolve_working_dir(Some(Path::new("/"))).unwrap_err();
        assert!(matches!(err, SandboxError::PathRestriction { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        let sandbox = sandbox_in(dir.path());

        let err = sandbox
            .resolve_working_dir(Some(Path::new("escape")))
            .unwrap_err();
        assert!(matches!(err, SandboxError::PathRestriction { .. }));
    }

    #[test]
    fn test_result_serializes_duration_as_millis() {
        let result = ExecutionResult {
            stdout: "ok".into(),
            stderr: String::new(),
            exit_code: 0,
            timed_out: false,
            duration: Duration::from_millis(1500),
            stdout_truncated: 0,
            stderr_truncated: 0,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration_ms"], 1500);
        assert_eq!(json["exit_code"], 0);
    }
}
