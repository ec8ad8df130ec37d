//! Builder for executing external tool commands with timeout and
//! cancellation support.
//!
//! Children are spawned in their own process group. When the timeout
//! elapses or the cancellation token fires, the whole group is killed so
//! encoder helper processes do not outlive the job.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use reel_core::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default command timeout: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Lines of stderr kept in error messages and diagnostics.
const STDERR_TAIL_LINES: usize = 40;

/// Longer stderr lines are truncated to this many bytes.
const MAX_LINE_BYTES: usize = 4096;

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Process exit status.
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Last lines of standard error (lossy UTF-8). Only the tail is kept,
    /// so a long-running encoder cannot grow it without bound.
    pub stderr: String,
}

impl ToolOutput {
    /// The retained stderr lines, trimmed.
    pub fn stderr_tail(&self) -> String {
        self.stderr.trim().to_string()
    }
}

/// A builder for constructing and executing external tool invocations.
///
/// # Example
///
/// ```no_run
/// use reel_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> reel_core::Result<()> {
/// let output = ToolCommand::new(PathBuf::from("ffprobe"))
///     .args(["-v", "error", "-print_format", "json", "-show_streams"])
///     .arg("/path/to/video.mp4")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    stdin_data: Option<Vec<u8>>,
    cancel: Option<CancellationToken>,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ToolCommand {
    /// Create a new command for the given program path.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            stdin_data: None,
            cancel: None,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Provide data to be written to the process's stdin.
    pub fn stdin(&mut self, data: Vec<u8>) -> &mut Self {
        self.stdin_data = Some(data);
        self
    }

    /// Abort the process when `token` is cancelled.
    pub fn cancel_on(&mut self, token: CancellationToken) -> &mut Self {
        self.cancel = Some(token);
        self
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Shell-like rendering of the command line, for logs.
    pub fn display(&self) -> String {
        let mut line = self.program.to_string_lossy().to_string();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains([' ', '"', '\'', ';', '[']) {
                line.push('\'');
                line.push_str(&arg.replace('\'', "'\\''"));
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }

    /// Execute the command and require a zero exit status.
    ///
    /// # Errors
    ///
    /// - [`Error::Tool`] if spawning fails, the timeout elapses, or the
    ///   process exits non-zero (message includes the stderr tail).
    /// - [`Error::Cancelled`] if the cancellation token fires.
    pub async fn execute(&self) -> Result<ToolOutput> {
        let output = self.output().await?;
        if !output.status.success() {
            return Err(Error::tool(
                self.program_name(),
                format!("exited with status {}: {}", output.status, output.stderr_tail()),
            ));
        }
        Ok(output)
    }

    /// Execute the command and return its output whatever the exit status.
    ///
    /// Timeout and cancellation are still errors since there is no exit
    /// status to report.
    pub async fn output(&self) -> Result<ToolOutput> {
        let program_name = self.program_name();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| Error::Tool {
            tool: program_name.clone(),
            message: format!("failed to spawn: {e}"),
        })?;
        let pid = child.id();

        if let (Some(data), Some(mut stdin)) = (self.stdin_data.clone(), child.stdin.take()) {
            // Written from a task so a child that fills stdout before
            // draining stdin cannot deadlock us.
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&data).await {
                    tracing::debug!("failed to write stdin: {e}");
                }
            });
        }

        let stdout_task = drain(child.stdout.take());
        let stderr_task = drain_tail(child.stderr.take(), STDERR_TAIL_LINES);

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
            _ = cancelled(self.cancel.as_ref()) => Outcome::Cancelled,
        };

        if !matches!(outcome, Outcome::Exited(_)) {
            terminate(&mut child, pid).await;
        }

        let stdout = collect(stdout_task).await;
        let stderr = stderr_task.await.unwrap_or_default();

        match outcome {
            Outcome::Exited(Ok(status)) => Ok(ToolOutput {
                status,
                stdout,
                stderr,
            }),
            Outcome::Exited(Err(e)) => Err(Error::Tool {
                tool: program_name,
                message: format!("I/O error waiting for process: {e}"),
            }),
            Outcome::TimedOut => {
                tracing::warn!(tool = %program_name, "killed after {:?} timeout", self.timeout);
                Err(Error::Tool {
                    tool: program_name,
                    message: format!("timed out after {:?}: {}", self.timeout, stderr.trim()),
                })
            }
            Outcome::Cancelled => {
                tracing::info!(tool = %program_name, "killed on cancellation");
                Err(Error::Cancelled(format!("{program_name} was cancelled")))
            }
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn drain<R>(stream: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            if let Err(e) = stream.read_to_end(&mut buf).await {
                tracing::debug!("failed to read child output: {e}");
            }
        }
        buf
    })
}

/// Read `stream` to the end, keeping only its last `max_lines` lines.
fn drain_tail<R>(stream: Option<R>, max_lines: usize) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = LineTail::new(max_lines);
        if let Some(mut stream) = stream {
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => tail.push(&chunk[..n]),
                    Err(e) => {
                        tracing::debug!("failed to read child stderr: {e}");
                        break;
                    }
                }
            }
        }
        tail.finish()
    })
}

/// Ring of the most recent lines of a byte stream. `\r` ends a line too,
/// so progress output redrawn in place does not pile up.
struct LineTail {
    lines: VecDeque<Vec<u8>>,
    partial: Vec<u8>,
    max_lines: usize,
}

impl LineTail {
    fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines),
            partial: Vec::new(),
            max_lines,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            match b {
                b'\n' | b'\r' => self.end_line(),
                _ if self.partial.len() < MAX_LINE_BYTES => self.partial.push(b),
                _ => {}
            }
        }
    }

    fn end_line(&mut self) {
        if self.partial.is_empty() || self.max_lines == 0 {
            self.partial.clear();
            return;
        }
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(std::mem::take(&mut self.partial));
    }

    fn finish(mut self) -> String {
        self.end_line();
        self.lines
            .iter()
            .map(|line| String::from_utf8_lossy(line))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

async fn collect(task: JoinHandle<Vec<u8>>) -> String {
    let bytes = task.await.unwrap_or_default();
    String::from_utf8_lossy(&bytes).to_string()
}

/// Kill the child's process group, then the child itself, and reap it.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_process_group(pid);
    if let Err(e) = child.kill().await {
        tracing::debug!("failed to kill child: {e}");
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        tracing::debug!(pid, "killpg failed: {e}");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn execute_echo() {
        let out = ToolCommand::new(PathBuf::from("echo"))
            .arg("hello")
            .execute()
            .await
            .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn execute_nonexistent_tool() {
        let result = ToolCommand::new(PathBuf::from("nonexistent_tool_xyz_12345"))
            .execute()
            .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("failed to spawn"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = ToolCommand::new(PathBuf::from("sh"))
            .args(["-c", "echo broken input >&2; exit 3"])
            .execute()
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("broken input"), "unexpected error: {msg}");
        assert!(matches!(err, Error::Tool { .. }));
    }

    #[tokio::test]
    async fn output_reports_failure_status() {
        let out = ToolCommand::new(PathBuf::from("sh"))
            .args(["-c", "echo oops >&2; exit 1"])
            .output()
            .await
            .unwrap();
        assert!(!out.status.success());
        assert_eq!(out.stderr_tail(), "oops");
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let out = ToolCommand::new(PathBuf::from("cat"))
            .stdin(b"piped".to_vec())
            .execute()
            .await
            .unwrap();
        assert_eq!(out.stdout, "piped");
    }

    #[tokio::test]
    async fn timeout_fires() {
        let started = Instant::now();
        let result = ToolCommand::new(PathBuf::from("sleep"))
            .arg("10")
            .timeout(Duration::from_millis(100))
            .execute()
            .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("timed out"), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn timeout_kills_grandchildren() {
        // The shell's child `sleep` shares the process group; if only the
        // shell were killed the stdout pipe would stay open for 10s.
        let started = Instant::now();
        let result = ToolCommand::new(PathBuf::from("sh"))
            .args(["-c", "sleep 10; echo done"])
            .timeout(Duration::from_millis(200))
            .execute()
            .await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_kills_process() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = ToolCommand::new(PathBuf::from("sleep"))
            .arg("10")
            .cancel_on(token)
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn display_quotes_complex_args() {
        let mut cmd = ToolCommand::new(PathBuf::from("/usr/bin/ffmpeg"));
        cmd.args(["-i", "in.mp4", "-var_stream_map", "v:0,a:0 v:1,a:1"]);
        assert_eq!(
            cmd.display(),
            "/usr/bin/ffmpeg -i in.mp4 -var_stream_map 'v:0,a:0 v:1,a:1'"
        );
        assert_eq!(cmd.program_name(), "ffmpeg");
    }

    #[test]
    fn tail_keeps_last_lines() {
        let mut tail = LineTail::new(3);
        let text = (0..100).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        tail.push(text.as_bytes());
        assert_eq!(tail.finish(), "97\n98\n99");
    }

    #[test]
    fn tail_splits_carriage_returns_and_caps_line_length() {
        let mut tail = LineTail::new(2);
        tail.push(b"frame=1\rframe=2\r\n");
        tail.push(&vec![b'x'; MAX_LINE_BYTES * 2]);
        let out = tail.finish();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "frame=2");
        assert_eq!(lines[1].len(), MAX_LINE_BYTES);
    }

    #[tokio::test]
    async fn chatty_stderr_is_bounded() {
        let out = ToolCommand::new(PathBuf::from("sh"))
            .args(["-c", "i=0; while [ $i -lt 5000 ]; do echo line $i >&2; i=$((i+1)); done"])
            .execute()
            .await
            .unwrap();
        assert_eq!(out.stderr.lines().count(), STDERR_TAIL_LINES);
        assert!(out.stderr.ends_with("line 4999"));
        assert!(out.stderr.starts_with("line 4960"));
    }
}
