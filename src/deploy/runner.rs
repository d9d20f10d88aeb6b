//! Runs one external shell command and streams its output.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hostdeck_common::{OutputChunk, OutputStream};

/// Longest fragment forwarded as one chunk when a line has no newline yet.
const MAX_CHUNK_BYTES: u64 = 8 * 1024;

/// How long to wait for the pipe readers after the process is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Exit code reported for results that have no real exit status.
pub const SYNTHETIC_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own; see the exit code.
    Exited,
    TimedOut,
    Cancelled,
    /// The process never started. Carries the OS error text.
    SpawnFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitResult {
    pub exit_code: i32,
    pub termination: Termination,
}

impl ExitResult {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            termination: Termination::Exited,
        }
    }

    pub fn synthetic(termination: Termination) -> Self {
        Self {
            exit_code: SYNTHETIC_EXIT_CODE,
            termination,
        }
    }

    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == 0
    }
}

/// Abstraction over process execution for testability.
/// Real implementation: `ShellRunner`.
///
/// Implementations never retry and never return an error: every failure to
/// run is reported as a non-successful [`ExitResult`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        spec: &CommandSpec,
        chunks: mpsc::Sender<OutputChunk>,
        cancel: CancellationToken,
    ) -> ExitResult;
}

/// Runs commands through `sh -c`, each in its own process group so a
/// timeout or cancel takes down everything the command started.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        chunks: mpsc::Sender<OutputChunk>,
        cancel: CancellationToken,
    ) -> ExitResult {
        if cancel.is_cancelled() {
            return ExitResult::synthetic(Termination::Cancelled);
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    command = %spec.command,
                    dir = %spec.working_dir.display(),
                    error = %e,
                    "failed to spawn command"
                );
                return ExitResult::synthetic(Termination::SpawnFailed(e.to_string()));
            }
        };
        debug!(command = %spec.command, pid = ?child.id(), "spawned command");

        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, OutputStream::Stdout, chunks.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, OutputStream::Stderr, chunks.clone())));
        }
        drop(chunks);

        let result = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => ExitResult::exited(status.code().unwrap_or(SYNTHETIC_EXIT_CODE)),
                Err(e) => {
                    warn!(command = %spec.command, error = %e, "failed to wait for command");
                    ExitResult::exited(SYNTHETIC_EXIT_CODE)
                }
            },
            _ = tokio::time::sleep(spec.timeout) => {
                info!(
                    command = %spec.command,
                    timeout_secs = spec.timeout.as_secs(),
                    "command timed out; killing process group"
                );
                terminate(&mut child).await;
                ExitResult::synthetic(Termination::TimedOut)
            }
            _ = cancel.cancelled() => {
                info!(command = %spec.command, "command cancelled; killing process group");
                terminate(&mut child).await;
                ExitResult::synthetic(Termination::Cancelled)
            }
        };

        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
                debug!(command = %spec.command, "output pipe still open after exit; detaching");
                abort.abort();
            }
        }

        result
    }
}

/// Forward a pipe as line-delimited chunks. Newlines are kept; a line longer
/// than `MAX_CHUNK_BYTES` is split, never inside a UTF-8 character.
async fn pump<R>(reader: R, stream: OutputStream, chunks: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    // Holds at most a partial character carried over between reads.
    let mut buf = Vec::with_capacity(1024);
    loop {
        match (&mut reader).take(MAX_CHUNK_BYTES).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let carry = if buf.ends_with(b"\n") {
                    0
                } else {
                    incomplete_utf8_tail(&buf)
                };
                let split = buf.len() - carry;
                if split > 0 {
                    let text = String::from_utf8_lossy(&buf[..split]).into_owned();
                    // Keep draining even if nobody listens, so the child never
                    // blocks on a full pipe.
                    let _ = chunks.send(OutputChunk { stream, text }).await;
                }
                buf.drain(..split);
            }
            Err(e) => {
                debug!(?stream, error = %e, "output pipe read failed");
                break;
            }
        }
    }
    if !buf.is_empty() {
        let text = String::from_utf8_lossy(&buf).into_owned();
        let _ = chunks.send(OutputChunk { stream, text }).await;
    }
}

/// Length of an unfinished multi-byte UTF-8 sequence at the end of `bytes`.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain syscall; the negative pid addresses the process
            // group created for this child.
            let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
            if rc != 0 {
                debug!(pid, error = %std::io::Error::last_os_error(), "process group kill failed");
            }
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "child kill failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn spec(command: &str, dir: &TempDir, timeout: Duration) -> CommandSpec {
        CommandSpec {
            command: command.to_string(),
            working_dir: dir.path().to_path_buf(),
            timeout,
        }
    }

    async fn run_collect(spec: CommandSpec, cancel: CancellationToken) -> (ExitResult, Vec<OutputChunk>) {
        let (tx, mut rx) = mpsc::channel(16);
        let collector = tokio::spawn(async move {
            let mut chunks = Vec::new();
            while let Some(chunk) = rx.recv().await {
                chunks.push(chunk);
            }
            chunks
        });
        let result = ShellRunner::new().run(&spec, tx, cancel).await;
        (result, collector.await.unwrap())
    }

    #[tokio::test]
    async fn test_streams_stdout_and_stderr() {
        let dir = TempDir::new().unwrap();
        let (result, chunks) = run_collect(
            spec("echo one; echo two; echo oops >&2", &dir, Duration::from_secs(10)),
            CancellationToken::new(),
        )
        .await;

        assert!(result.success());
        let stdout: Vec<_> = chunks.iter().filter(|c| !c.is_stderr()).map(|c| c.text.as_str()).collect();
        assert_eq!(stdout, vec!["one\n", "two\n"]);
        let stderr: Vec<_> = chunks.iter().filter(|c| c.is_stderr()).map(|c| c.text.as_str()).collect();
        assert_eq!(stderr, vec!["oops\n"]);
    }

    #[tokio::test]
    async fn test_keeps_trailing_partial_line() {
        let dir = TempDir::new().unwrap();
        let (result, chunks) = run_collect(
            spec("printf 'no newline'", &dir, Duration::from_secs(10)),
            CancellationToken::new(),
        )
        .await;
        assert!(result.success());
        assert_eq!(chunks, vec![OutputChunk::stdout("no newline")]);
    }

    #[tokio::test]
    async fn test_long_line_split_keeps_characters_whole() {
        let dir = TempDir::new().unwrap();
        // One ASCII byte first so the 8 KiB boundary falls inside a character.
        let (result, chunks) = run_collect(
            spec(
                "printf a; i=0; while [ $i -lt 5000 ]; do printf 'é'; i=$((i+1)); done",
                &dir,
                Duration::from_secs(30),
            ),
            CancellationToken::new(),
        )
        .await;
        assert!(result.success());
        assert!(chunks.len() >= 2);
        let text: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert!(!text.contains('\u{FFFD}'));
        assert_eq!(text, format!("a{}", "é".repeat(5000)));
    }

    #[test]
    fn test_incomplete_utf8_tail() {
        assert_eq!(incomplete_utf8_tail(b"plain"), 0);
        assert_eq!(incomplete_utf8_tail("é".as_bytes()), 0);
        assert_eq!(incomplete_utf8_tail(&"é".as_bytes()[..1]), 1);
        assert_eq!(incomplete_utf8_tail(&"€".as_bytes()[..2]), 2);
        assert_eq!(incomplete_utf8_tail(&"a🦀".as_bytes()[..4]), 3);
        assert_eq!(incomplete_utf8_tail("a🦀".as_bytes()), 0);
        assert_eq!(incomplete_utf8_tail(b""), 0);
    }

    #[tokio::test]
    async fn test_runs_in_working_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here\n").unwrap();
        let (result, chunks) = run_collect(
            spec("cat marker.txt", &dir, Duration::from_secs(10)),
            CancellationToken::new(),
        )
        .await;
        assert!(result.success());
        assert_eq!(chunks, vec![OutputChunk::stdout("here\n")]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_data() {
        let dir = TempDir::new().unwrap();
        let (result, _) = run_collect(
            spec("exit 3", &dir, Duration::from_secs(10)),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result, ExitResult::exited(3));
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = TempDir::new().unwrap();
        let started = Instant::now();
        let (result, chunks) = run_collect(
            spec("echo begin; sleep 30 & wait", &dir, Duration::from_millis(300)),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(result.termination, Termination::TimedOut);
        assert_eq!(result.exit_code, SYNTHETIC_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(chunks, vec![OutputChunk::stdout("begin\n")]);
    }

    #[tokio::test]
    async fn test_cancel_kills_running_command() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let (result, _) = run_collect(spec("sleep 30", &dir, Duration::from_secs(60)), cancel).await;
        assert_eq!(result.termination, Termination::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_already_cancelled_never_spawns() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (result, chunks) = run_collect(spec("echo hi", &dir, Duration::from_secs(10)), cancel).await;
        assert_eq!(result.termination, Termination::Cancelled);
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synthetic_result() {
        let dir = TempDir::new().unwrap();
        let mut spec = spec("echo hi", &dir, Duration::from_secs(10));
        spec.working_dir = dir.path().join("does-not-exist");
        let (result, chunks) = run_collect(spec, CancellationToken::new()).await;

        assert!(matches!(result.termination, Termination::SpawnFailed(_)));
        assert_eq!(result.exit_code, SYNTHETIC_EXIT_CODE);
        assert!(!result.success());
        assert!(chunks.is_empty());
    }
}
