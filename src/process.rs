//! Subprocess execution with deadlines, bounded output and interrupt handling.
//!
//! Every external tool (git, the mutant generator, the project's build and test
//! commands) goes through [`run_with_timeout`], so a timeout is always reported
//! as its own outcome rather than folded into a failure.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Notify;

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Exit code 0.
    Success,
    /// Non-zero exit, or killed by a signal (`None`).
    Failed(Option<i32>),
    /// The deadline passed; the process was killed.
    TimedOut,
    /// The process could not be started or waited on.
    SpawnFailed,
    /// An interrupt arrived while waiting; the process was killed.
    Interrupted,
}

/// Result of running a command.
#[derive(Debug)]
pub struct CommandResult {
    pub status: CommandStatus,
    /// Combined stdout and stderr output, truncated to the caller's cap.
    pub output: String,
    /// How long the command took to run in milliseconds.
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

/// Shared interrupt flag, set from the Ctrl-C listener.
///
/// Cheap to clone; every clone observes the same flag.
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

#[derive(Default)]
struct InterruptInner {
    requested: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the interrupt as requested and wake every waiter.
    pub fn trigger(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolve once an interrupt has been requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Spawn a task that turns Ctrl-C into [`Interrupt::trigger`].
    ///
    /// Once installed the process no longer dies on SIGINT, so every long wait
    /// must select on [`Interrupt::wait`].
    pub fn listen_for_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let interrupt = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                    return;
                }
                if interrupt.is_requested() {
                    tracing::warn!("Interrupt already in progress, waiting for sources to be restored");
                } else {
                    tracing::warn!("Interrupt received, stopping after the current step");
                    interrupt.trigger();
                }
            }
        })
    }
}

/// Build a `sh -c <command>` invocation rooted at `working_dir`.
pub fn shell_command(working_dir: &Path, command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(working_dir);
    cmd
}

/// Polls spent waiting for a killed process group to empty.
const GROUP_EXIT_POLLS: u32 = 25;
const GROUP_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The process group led by a spawned command.
///
/// Anything still in the group is sent SIGKILL when this is dropped, so
/// background children of a cancelled command never outlive it.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(leader: Option<u32>) -> Self {
        Self {
            pgid: leader.filter(|_| cfg!(unix)),
        }
    }

    /// Kill every process left in the group and wait briefly for it to empty.
    ///
    /// The group leader must already be reaped, otherwise its zombie keeps
    /// the group alive until the polls run out.
    async fn terminate(mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        let target = format!("-{}", pgid);
        if !signal_group("-KILL", &target).await {
            return;
        }
        for _ in 0..GROUP_EXIT_POLLS {
            if !signal_group("-0", &target).await {
                return;
            }
            tokio::time::sleep(GROUP_EXIT_POLL_INTERVAL).await;
        }
        tracing::debug!("Process group {} still has members after SIGKILL", pgid);
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            let _ = std::process::Command::new("kill")
                .args(["-KILL", "--", &format!("-{}", pgid)])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }
}

/// Send `signal` to the process group `target` (`-<pgid>`). True if any member received it.
async fn signal_group(signal: &str, target: &str) -> bool {
    Command::new("kill")
        .args([signal, "--", target])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

/// Run a command with a deadline.
///
/// The command runs in its own process group. When the deadline passes or
/// `interrupt` fires first, the whole group is killed and the direct child is
/// reaped before this returns. Processes the command left running in the
/// background are killed on every path. stdout and stderr are combined and
/// truncated to `max_output_bytes`.
pub async fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
    max_output_bytes: usize,
    interrupt: Option<&Interrupt>,
) -> CommandResult {
    let start = Instant::now();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            return CommandResult {
                status: CommandStatus::SpawnFailed,
                output: format!("Failed to spawn command: {}", e),
                duration_ms: start.elapsed().as_millis() as u64,
            };
        }
    };

    let group = ProcessGroup::new(child.id());
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let interrupted = async {
        match interrupt {
            Some(i) => i.wait().await,
            None => std::future::pending::<()>().await,
        }
    };

    let finished = async {
        let (status, stdout, stderr) =
            tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr));
        status.map(|s| (s, stdout, stderr))
    };

    // An interrupt wins over a child that exited in the same poll.
    let result = tokio::select! {
        biased;
        _ = interrupted => None,
        result = tokio::time::timeout(timeout, finished) => Some(result),
    };

    if !matches!(result, Some(Ok(Ok(_)))) {
        // SIGKILL the leader and reap it so the group can empty
        let _ = child.kill().await;
    }
    group.terminate().await;

    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Some(Ok(Ok((status, stdout, stderr)))) => {
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&stdout),
                String::from_utf8_lossy(&stderr)
            );
            let status = if status.success() {
                CommandStatus::Success
            } else {
                CommandStatus::Failed(status.code())
            };

            CommandResult {
                status,
                output: truncate_output(&combined, max_output_bytes),
                duration_ms,
            }
        }
        Some(Ok(Err(e))) => CommandResult {
            status: CommandStatus::SpawnFailed,
            output: format!("Command execution error: {}", e),
            duration_ms,
        },
        Some(Err(_)) => {
            tracing::debug!("Command timed out after {:?}", timeout);
            CommandResult {
                status: CommandStatus::TimedOut,
                output: format!("Command timed out after {} seconds", timeout.as_secs()),
                duration_ms,
            }
        }
        None => CommandResult {
            status: CommandStatus::Interrupted,
            output: "Command interrupted".to_string(),
            duration_ms,
        },
    }
}

/// Check whether a program can be launched, by running it with `args`.
pub async fn program_available(program: &str, args: &[&str]) -> bool {
    let mut cmd = Command::new(program);
    cmd.args(args);
    run_with_timeout(cmd, Duration::from_secs(30), 4096, None)
        .await
        .success()
}

/// Truncate output to at most `max_bytes`, on a character boundary.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let mut end = max_bytes;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &output[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_output() {
        let short = "hello";
        assert_eq!(truncate_output(short, 100), "hello");

        let long = "a".repeat(100);
        let truncated = truncate_output(&long, 50);
        assert!(truncated.len() < 100);
        assert!(truncated.ends_with("...(truncated)"));
    }

    #[test]
    fn test_truncate_output_exact_boundary() {
        let exact = "a".repeat(50);
        assert_eq!(truncate_output(&exact, 50), exact);
    }

    #[test]
    fn test_truncate_output_multibyte() {
        // 'é' is two bytes; cutting at 3 would split the second one
        let text = "éé";
        assert_eq!(truncate_output(text, 3), "é...(truncated)");
    }

    #[tokio::test]
    async fn test_run_success() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_with_timeout(
            shell_command(dir.path(), "echo out; echo err 1>&2"),
            Duration::from_secs(10),
            1000,
            None,
        )
        .await;
        assert_eq!(result.status, CommandStatus::Success);
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[tokio::test]
    async fn test_run_failure_keeps_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_with_timeout(
            shell_command(dir.path(), "exit 3"),
            Duration::from_secs(10),
            1000,
            None,
        )
        .await;
        assert_eq!(result.status, CommandStatus::Failed(Some(3)));
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_with_timeout(
            shell_command(dir.path(), "sleep 5"),
            Duration::from_millis(200),
            1000,
            None,
        )
        .await;
        assert_eq!(result.status, CommandStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_with_timeout(
            shell_command(dir.path(), "sh -c 'sleep 1; touch late'; true"),
            Duration::from_millis(200),
            1000,
            None,
        )
        .await;
        assert_eq!(result.status, CommandStatus::TimedOut);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late").exists());
    }

    #[tokio::test]
    async fn test_finished_command_leaves_no_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_with_timeout(
            shell_command(dir.path(), "(sleep 1; touch late) >/dev/null 2>&1 & exit 0"),
            Duration::from_secs(10),
            1000,
            None,
        )
        .await;
        assert_eq!(result.status, CommandStatus::Success);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late").exists());
    }

    #[tokio::test]
    async fn test_run_spawn_failure() {
        let cmd = Command::new("/nonexistent/definitely-not-a-binary");
        let result = run_with_timeout(cmd, Duration::from_secs(1), 1000, None).await;
        assert_eq!(result.status, CommandStatus::SpawnFailed);
    }

    #[tokio::test]
    async fn test_run_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let interrupt = Interrupt::new();
        interrupt.trigger();
        let result = run_with_timeout(
            shell_command(dir.path(), "sleep 5"),
            Duration::from_secs(10),
            1000,
            Some(&interrupt),
        )
        .await;
        assert_eq!(result.status, CommandStatus::Interrupted);
    }

    #[tokio::test]
    async fn test_run_output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_with_timeout(
            shell_command(dir.path(), "yes | head -n 1000"),
            Duration::from_secs(10),
            20,
            None,
        )
        .await;
        assert!(result.output.ends_with("...(truncated)"));
        assert!(result.output.len() <= 20 + "...(truncated)".len());
    }

    #[test]
    fn test_interrupt_shared_between_clones() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();
        assert!(!clone.is_requested());
        interrupt.trigger();
        assert!(clone.is_requested());
    }

    #[tokio::test]
    async fn test_interrupt_wait_after_trigger_returns() {
        let interrupt = Interrupt::new();
        interrupt.trigger();
        tokio::time::timeout(Duration::from_secs(1), interrupt.wait())
            .await
            .unwrap();
    }
}
