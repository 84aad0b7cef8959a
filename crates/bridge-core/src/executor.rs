use core::time::Duration;
use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Instant,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt as _},
    process::Command,
};
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;

pub const TIMEOUT_EXIT_CODE: i32 = -1;
pub const TIMEOUT_STDERR: &str = "timed out";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub command: String,
    pub cwd: PathBuf,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    /// At least one stream hit the capture limit and was cut.
    pub output_truncated: bool,
}

impl ExecutionResult {
    #[must_use]
    pub fn timed_out(command: &str, cwd: &Path) -> Self {
        Self {
            command: command.to_owned(),
            cwd: cwd.to_path_buf(),
            stdout: String::new(),
            stderr: TIMEOUT_STDERR.to_owned(),
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: true,
            output_truncated: false,
        }
    }

    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Chat-friendly rendering: a status line followed by the captured output.
    #[must_use]
    pub fn render(&self) -> String {
        let status = if self.timed_out {
            format!("⏱️ `{}` timed out (exit {})", self.command, self.exit_code)
        } else if self.succeeded() {
            format!("✅ `{}` (exit 0)", self.command)
        } else {
            format!("❌ `{}` (exit {})", self.command, self.exit_code)
        };
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        let body = match (stdout.is_empty(), stderr.is_empty()) {
            (false, false) => format!("--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}"),
            (false, true) => stdout.to_owned(),
            (true, false) => stderr.to_owned(),
            (true, true) => "(no output)".to_owned(),
        };
        if self.output_truncated {
            format!("{status}\n{body}\n(output truncated)")
        } else {
            format!("{status}\n{body}")
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `command` rooted at `cwd`. Never fails: non-zero exits, timeouts
    /// and spawn errors are all encoded in the result.
    async fn execute(&self, command: &str, cwd: &Path) -> ExecutionResult;
}

#[derive(Debug, Clone)]
pub struct ShellExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ShellExecutor {
    #[must_use]
    pub fn new(config: &ExecutorConfig) -> Self {
        let mut shell = config.shell.iter().cloned();
        let program = shell.next().unwrap_or_else(|| "sh".to_owned());
        let mut args: Vec<String> = shell.collect();
        if config.shell.is_empty() {
            args.push("-c".to_owned());
        }
        Self {
            program,
            args,
            timeout: config.timeout(),
            max_output_bytes: config.max_output_bytes,
        }
    }

    fn spawn_failure(&self, command: &str, cwd: &Path, err: &std::io::Error) -> ExecutionResult {
        warn!(error = %err, cwd = %cwd.display(), "Failed to start command");
        ExecutionResult {
            command: command.to_owned(),
            cwd: cwd.to_path_buf(),
            stdout: String::new(),
            stderr: format!("failed to start {}: {err}", self.program),
            exit_code: -1,
            timed_out: false,
            output_truncated: false,
        }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, command: &str, cwd: &Path) -> ExecutionResult {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The child leads its own group so a timeout can take down everything it forked.
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(program = %self.program, cwd = %cwd.display(), command, "Spawning command");
        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return self.spawn_failure(command, cwd, &err),
        };
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            tokio::join!(
                read_capped(stdout, self.max_output_bytes),
                read_capped(stderr, self.max_output_bytes),
                child.wait(),
            )
        };
        let outcome = tokio::time::timeout(self.timeout, run).await;
        let Ok(((stdout, stdout_cut), (stderr, stderr_cut), status)) = outcome else {
            warn!(timeout_s = self.timeout.as_secs_f64(), command, "Command timed out");
            kill_process_group(pid);
            if let Err(err) = child.kill().await {
                debug!(error = %err, "Child already gone after timeout");
            }
            return ExecutionResult::timed_out(command, cwd);
        };
        let status = match status {
            Ok(status) => status,
            Err(err) => return self.spawn_failure(command, cwd, &err),
        };

        let exit_code = exit_code(status);
        let output_truncated = stdout_cut || stderr_cut;
        info!(
            exit_code,
            output_truncated,
            elapsed_ms = started.elapsed().as_millis(),
            "Command finished"
        );
        ExecutionResult {
            command: command.to_owned(),
            cwd: cwd.to_path_buf(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            timed_out: false,
            output_truncated,
        }
    }
}

/// Keeps at most `limit` bytes and drains the rest so the child never blocks
/// on a full pipe. The flag reports whether anything was discarded.
async fn read_capped<R>(reader: Option<R>, limit: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return (Vec::new(), false);
    };
    let mut kept = Vec::new();
    let mut head = reader.take(u64::try_from(limit).unwrap_or(u64::MAX));
    if let Err(err) = head.read_to_end(&mut kept).await {
        debug!(error = %err, "Output stream read failed");
    }
    let mut rest = head.into_inner();
    let discarded = tokio::io::copy(&mut rest, &mut tokio::io::sink())
        .await
        .unwrap_or(0);
    (kept, discarded > 0)
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; `pgid` is the group created for this child.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
const fn kill_process_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt as _;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn executor(timeout_secs: u64) -> ShellExecutor {
        ShellExecutor::new(&ExecutorConfig {
            timeout_secs,
            ..ExecutorConfig::default()
        })
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_separately() {
        let tmp = tempfile::tempdir().unwrap();
        let result = executor(10)
            .execute("echo out; echo err 1>&2", tmp.path())
            .await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_result() {
        let tmp = tempfile::tempdir().unwrap();
        let result = executor(10).execute("exit 3", tmp.path()).await;
        assert_eq!(result.exit_code, 3);
        assert!(!result.timed_out);
        assert!(result.render().contains("exit 3"));
    }

    #[tokio::test]
    async fn runs_in_requested_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"").unwrap();
        let result = executor(10).execute("ls", tmp.path()).await;
        assert_eq!(result.stdout, "a.txt\n");
        assert_eq!(result.cwd, tmp.path());
    }

    #[tokio::test]
    async fn timeout_returns_sentinel() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = ShellExecutor {
            timeout: Duration::from_millis(200),
            ..executor(1)
        };
        let started = Instant::now();
        let result = exec.execute("sleep 5", tmp.path()).await;
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.stderr, TIMEOUT_STDERR);
    }

    /// Live, non-zombie process check via procfs.
    #[cfg(target_os = "linux")]
    fn running(pid: &str) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
            stat.rsplit_once(") ")
                .is_some_and(|(_, rest)| !rest.starts_with('Z'))
        })
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_forked_processes() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = ShellExecutor {
            timeout: Duration::from_millis(300),
            ..executor(1)
        };
        let result = exec
            .execute("sleep 47 & echo $! > sleep.pid; wait; echo done", tmp.path())
            .await;
        assert!(result.timed_out);

        let pid = std::fs::read_to_string(tmp.path().join("sleep.pid")).unwrap();
        let pid = pid.trim();
        let mut alive = running(pid);
        for _ in 0..20 {
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            alive = running(pid);
        }
        assert!(!alive, "forked sleep {pid} survived the timeout");
    }

    #[tokio::test]
    async fn output_is_capped() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = ShellExecutor {
            max_output_bytes: 1024,
            ..executor(10)
        };
        let result = exec.execute("head -c 300000 /dev/zero", tmp.path()).await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.len(), 1024);
        assert!(result.output_truncated);
        assert!(result.render().ends_with("(output truncated)"));
    }

    #[tokio::test]
    async fn small_output_is_not_marked() {
        let tmp = tempfile::tempdir().unwrap();
        let result = executor(10).execute("echo short", tmp.path()).await;
        assert!(!result.output_truncated);
    }

    #[tokio::test]
    async fn missing_directory_is_reported_not_raised() {
        let result = executor(10)
            .execute("true", Path::new("/definitely/not/here"))
            .await;
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.starts_with("failed to start"));
    }

    #[test]
    fn render_formats_both_streams() {
        let result = ExecutionResult {
            command: "make".to_owned(),
            cwd: PathBuf::from("/work"),
            stdout: "built\n".to_owned(),
            stderr: "warning\n".to_owned(),
            exit_code: 0,
            timed_out: false,
            output_truncated: false,
        };
        assert_eq!(
            result.render(),
            "✅ `make` (exit 0)\n--- stdout ---\nbuilt\n--- stderr ---\nwarning"
        );
    }
}
