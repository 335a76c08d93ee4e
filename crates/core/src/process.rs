//! External command execution with mandatory timeouts.
//!
//! Every component that drives an external tool (`systemctl`,
//! `xtrabackup`, `mysqldump`, `cp`, `chown`, ...) goes through a
//! [`CommandRunner`]. The production implementation, [`SystemRunner`],
//! spawns the child in its own process group so that a timeout kills the
//! whole tree, not just the direct child.

use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Maximum stdout or stderr size captured per stream (10 MiB).
///
/// Output beyond this limit is discarded; the stream is still drained so
/// the child never blocks on a full pipe.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// A single external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Run the command as this account through the privilege wrapper.
    pub as_user: Option<String>,
    /// Maximum wall-clock time before the process tree is killed.
    pub timeout: Duration,
    /// When set, a non-zero exit is returned as output instead of
    /// [`ProcessError::CommandFailed`]. Timeouts are never tolerated.
    pub best_effort: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            as_user: None,
            timeout,
            best_effort: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.as_user = Some(user.into());
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    /// Human-readable command line, used in logs and error messages.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.as_user {
            Some(user) => write!(f, "[{user}] {}", self.command_line()),
            None => f.write_str(&self.command_line()),
        }
    }
}

/// Captured output from a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code (`-1` if killed by signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors raised by a [`CommandRunner`].
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {}s", .timeout.as_secs_f64())]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` failed with exit code {exit_code}: {}", .stderr.trim())]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
}

impl ProcessError {
    /// Exit code of the failed command, if it ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

/// Executes external commands.
///
/// Implementations must never block past `invocation.timeout` and must
/// map a non-zero exit to [`ProcessError::CommandFailed`] unless the
/// invocation is best-effort. No retries happen at this layer.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        invocation: &Invocation,
    ) -> impl std::future::Future<Output = Result<CommandOutput, ProcessError>> + Send;
}

/// Runs commands on the local host via `tokio::process`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    /// Program used to switch accounts (`sudo`). `None` runs everything as
    /// the current user and ignores `as_user`.
    privilege_wrapper: Option<String>,
}

impl SystemRunner {
    pub fn new(privilege_wrapper: Option<String>) -> Self {
        Self {
            privilege_wrapper: privilege_wrapper.filter(|w| !w.trim().is_empty()),
        }
    }

    /// A runner that executes commands directly, without a wrapper.
    pub fn direct() -> Self {
        Self {
            privilege_wrapper: None,
        }
    }

    fn build_command(&self, invocation: &Invocation) -> Command {
        match (&self.privilege_wrapper, &invocation.as_user) {
            (Some(wrapper), Some(user)) => {
                let mut cmd = Command::new(wrapper);
                cmd.args(["-n", "-u", user.as_str(), "--"])
                    .arg(&invocation.program)
                    .args(&invocation.args);
                cmd
            }
            _ => {
                let mut cmd = Command::new(&invocation.program);
                cmd.args(&invocation.args);
                cmd
            }
        }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Some("sudo".to_string()))
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ProcessError> {
        let command = invocation.to_string();
        let mut cmd = self.build_command(invocation);

        // `kill_on_drop(true)` covers the direct child; the process group
        // guard covers anything it forked.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(command = %command, timeout_secs = invocation.timeout.as_secs(), "Spawning command");

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: command.clone(),
            source,
        })?;
        let mut group = ProcessGroupGuard::new(child.id());

        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let wait_result = tokio::time::timeout(invocation.timeout, child.wait()).await;
        let status = match wait_result {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => return Err(ProcessError::Spawn { command, source }),
            Err(_elapsed) => {
                // Dropping the guard kills the whole group; dropping the
                // child reaps the direct descendant.
                drop(group);
                drop(child);
                stdout_task.abort();
                stderr_task.abort();
                tracing::warn!(
                    command = %command,
                    timeout_secs = invocation.timeout.as_secs(),
                    "Command timed out, process group killed",
                );
                return Err(ProcessError::Timeout {
                    command,
                    timeout: invocation.timeout,
                });
            }
        };
        group.disarm();

        let output = CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned(),
            duration_ms: start.elapsed().as_millis() as u64,
        };

        tracing::debug!(
            command = %command,
            exit_code = output.exit_code,
            elapsed_ms = output.duration_ms,
            "Command finished",
        );

        check_exit(invocation, command, output)
    }
}

/// Apply the best-effort policy to a finished command.
pub fn check_exit(
    invocation: &Invocation,
    command: String,
    output: CommandOutput,
) -> Result<CommandOutput, ProcessError> {
    if output.success() || invocation.best_effort {
        Ok(output)
    } else {
        Err(ProcessError::CommandFailed {
            command,
            exit_code: output.exit_code,
            stderr: output.stderr,
        })
    }
}

/// Kills the child's process group on drop unless disarmed.
///
/// Covers both an expired timeout and cancellation of the in-flight future
/// (e.g. a worker pool dropping a task).
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take() {
            // SAFETY: killpg has no memory-safety preconditions; a stale
            // group id yields ESRCH, which is ignored.
            unsafe {
                libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
}

/// Read an entire output stream, keeping at most [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
        // Drain the remainder so a chatty child does not stall on a full pipe.
        let _ = tokio::io::copy(&mut h, &mut tokio::io::sink()).await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn sh(script: &str, timeout: Duration) -> Invocation {
        Invocation::new("sh", timeout).args(["-c", script])
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = SystemRunner::direct()
            .run(&sh("echo hello; echo oops >&2", Duration::from_secs(5)))
            .await
            .expect("run");
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn nonzero_exit_is_command_failed() {
        let result = SystemRunner::direct()
            .run(&sh("echo broken >&2; exit 42", Duration::from_secs(5)))
            .await;
        assert_matches!(
            result,
            Err(ProcessError::CommandFailed { exit_code: 42, ref stderr, .. }) if stderr.trim() == "broken"
        );
    }

    #[tokio::test]
    async fn best_effort_tolerates_nonzero_exit() {
        let out = SystemRunner::direct()
            .run(&sh("exit 3", Duration::from_secs(5)).best_effort())
            .await
            .expect("best effort run");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let start = Instant::now();
        let result = SystemRunner::direct()
            .run(&sh("sleep 30", Duration::from_millis(200)))
            .await;
        assert_matches!(result, Err(ProcessError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn timeout_is_not_tolerated_in_best_effort_mode() {
        let result = SystemRunner::direct()
            .run(&sh("sleep 30", Duration::from_millis(200)).best_effort())
            .await;
        assert_matches!(result, Err(ProcessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn timeout_kills_descendants() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("marker");
        // The grandchild would create the marker after one second.
        let script = format!("(sleep 1; touch {}) & wait", marker.display());
        let result = SystemRunner::direct()
            .run(&sh(&script, Duration::from_millis(200)))
            .await;
        assert_matches!(result, Err(ProcessError::Timeout { .. }));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "descendant survived the timeout");
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let result = SystemRunner::direct()
            .run(&Invocation::new("/nonexistent/xbval-tool", Duration::from_secs(1)))
            .await;
        assert_matches!(result, Err(ProcessError::Spawn { .. }));
    }

    #[test]
    fn wrapper_prefixes_user_switch() {
        let runner = SystemRunner::new(Some("sudo".into()));
        let inv = Invocation::new("xtrabackup", Duration::from_secs(1))
            .arg("--prepare")
            .as_user("mysql");
        let cmd = runner.build_command(&inv);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "sudo");
        let args: Vec<_> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["-n", "-u", "mysql", "--", "xtrabackup", "--prepare"]);
    }

    #[test]
    fn empty_wrapper_runs_directly() {
        let runner = SystemRunner::new(Some("  ".into()));
        let inv = Invocation::new("cp", Duration::from_secs(1)).as_user("root");
        assert_eq!(runner.build_command(&inv).as_std().get_program(), "cp");
    }

    #[test]
    fn display_includes_user() {
        let inv = Invocation::new("chown", Duration::from_secs(1))
            .args(["-R", "mysql:mysql", "/data"])
            .as_user("root");
        assert_eq!(inv.to_string(), "[root] chown -R mysql:mysql /data");
    }
}
