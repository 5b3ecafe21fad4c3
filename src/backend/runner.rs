//! Child-process ownership and stdio plumbing for the STT backend.
//!
//! [`ProcessRunner`] spawns the backend with all three standard streams
//! piped and turns them into typed sequences:
//!
//! * stdout → decoded [`BackendEvent`]s on a single-consumer channel,
//! * stderr → raw log lines on a second channel,
//! * stdin  ← encoded [`BackendCommand`]s through a serialized write path.
//!
//! stdout bytes arrive in arbitrary chunks; a byte buffer collects them and
//! only complete newline-terminated lines are decoded.  Malformed lines are
//! logged and dropped — they never tear down the channel.  A partial line
//! left over when the pipe closes (the backend died mid-write) is dropped
//! undecoded.
//!
//! A non-zero process exit synthesizes one final `error` event naming the
//! exit status, *after* every real event has been delivered, so the consumer
//! always observes unexpected exits without polling.
//!
//! At most one child is live per runner: a second [`start`](ProcessRunner::start)
//! while one is active fails with [`RunnerError::AlreadyRunning`] — it never
//! silently replaces the handle.  Dropping the runner kills a still-live
//! child (`kill_on_drop`).

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{BackendCommand, BackendEvent, ProtocolError};

use super::resolver::LaunchCommand;

// ---------------------------------------------------------------------------
// RunnerError
// ---------------------------------------------------------------------------

/// Errors raised by [`ProcessRunner`] operations.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// `start` was called while a child process is still active.
    #[error("backend process is already running")]
    AlreadyRunning,

    /// `send` was called with no active child process.
    #[error("backend process is not running")]
    NotRunning,

    /// The OS refused to create the child process.
    #[error("failed to spawn backend process: {0}")]
    Spawn(#[source] std::io::Error),

    /// A stdin write failed for a reason other than a closed pipe.
    #[error("failed to write command to backend: {0}")]
    Write(#[source] std::io::Error),

    /// A command failed to encode (should not happen for these types).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

/// Capacity of the event and log channels.  The backend manager drains both
/// continuously; the bound only matters if a consumer stalls.
const CHANNEL_CAPACITY: usize = 64;

/// Read-buffer size for the stdout chunk loop.
const READ_CHUNK_BYTES: usize = 4096;

/// How often the exit watcher polls `try_wait` after stdout closes.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Owns one backend child process and its three pipes.
///
/// Create with [`ProcessRunner::new`], then call [`start`](Self::start).
/// The backend manager creates a fresh runner per launch and drops it at
/// teardown.
pub struct ProcessRunner {
    /// Handle slots, shared (weakly) with the exit-watcher task.  The runner
    /// holds the only strong reference, so dropping it drops a still-live
    /// child, which `kill_on_drop` then reaps.
    inner: Arc<Inner>,
}

struct Inner {
    /// The child handle.  `None` before `start` and after the exit watcher
    /// has observed the process exit.
    child: Mutex<Option<Child>>,
    /// Serialized command write path.  Concurrent `send` calls never
    /// interleave partial lines.
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    /// Decoded-event receiver, handed out once by [`ProcessRunner::events`].
    events_rx: Mutex<Option<mpsc::Receiver<BackendEvent>>>,
    /// Stderr-line receiver, handed out once by [`ProcessRunner::logs`].
    logs_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl ProcessRunner {
    /// Create a runner with no child attached.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                child: Mutex::new(None),
                stdin: tokio::sync::Mutex::new(None),
                events_rx: Mutex::new(None),
                logs_rx: Mutex::new(None),
            }),
        }
    }

    /// Spawn the backend process and begin reading its streams.
    ///
    /// Returns as soon as the process is spawned — it does **not** wait for
    /// the backend to become ready.
    ///
    /// # Errors
    ///
    /// * [`RunnerError::AlreadyRunning`] — a child is already active.
    /// * [`RunnerError::Spawn`] — the OS could not create the process.
    pub async fn start(&self, command: LaunchCommand) -> Result<(), RunnerError> {
        if self.inner.child.lock().unwrap().is_some() {
            return Err(RunnerError::AlreadyRunning);
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = &command.env {
            cmd.env_clear();
            cmd.envs(env);
        }
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(RunnerError::Spawn)?;
        let stdin = take_pipe(child.stdin.take(), "stdin")?;
        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr = take_pipe(child.stderr.take(), "stderr")?;

        {
            let mut slot = self.inner.child.lock().unwrap();
            if slot.is_some() {
                // Lost a start/start race — keep the first child, kill ours.
                let _ = child.start_kill();
                return Err(RunnerError::AlreadyRunning);
            }
            *slot = Some(child);
        }
        *self.inner.stdin.lock().await = Some(stdin);

        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (log_tx, log_rx) = mpsc::channel(CHANNEL_CAPACITY);
        *self.inner.events_rx.lock().unwrap() = Some(event_rx);
        *self.inner.logs_rx.lock().unwrap() = Some(log_rx);

        let stdout_reader = tokio::spawn(read_events(stdout, event_tx.clone()));
        tokio::spawn(read_logs(stderr, log_tx));
        tokio::spawn(watch_exit(
            Arc::downgrade(&self.inner),
            stdout_reader,
            event_tx,
        ));

        log::info!("backend process started: {}", command.program.display());
        Ok(())
    }

    /// Serialize `command` and write it as one line to the backend's stdin.
    ///
    /// # Errors
    ///
    /// * [`RunnerError::NotRunning`] — no active process, or the pipe is
    ///   already closed (broken pipe).
    /// * [`RunnerError::Write`] — any other I/O failure.
    pub async fn send(&self, command: &BackendCommand) -> Result<(), RunnerError> {
        let line = command.to_line()?;

        if !self.is_running() {
            return Err(RunnerError::NotRunning);
        }

        let mut guard = self.inner.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(RunnerError::NotRunning)?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(map_write_error)?;
        stdin.flush().await.map_err(map_write_error)
    }

    /// Take the decoded-event receiver.
    ///
    /// Single-consumer: the first call after [`start`](Self::start) returns
    /// the live receiver; any other call returns an already-closed one.
    pub fn events(&self) -> mpsc::Receiver<BackendEvent> {
        self.inner
            .events_rx
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(closed_receiver)
    }

    /// Take the stderr log-line receiver.  Same single-consumer contract as
    /// [`events`](Self::events).
    pub fn logs(&self) -> mpsc::Receiver<String> {
        self.inner
            .logs_rx
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(closed_receiver)
    }

    /// Point-in-time liveness check.
    pub fn is_running(&self) -> bool {
        let mut slot = self.inner.child.lock().unwrap();
        match slot.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Request OS-level termination of the child (SIGTERM on unix).
    ///
    /// Non-blocking: does not wait for the process to exit.  No-op when no
    /// process is active.
    pub fn terminate(&self) {
        let mut slot = self.inner.child.lock().unwrap();
        let Some(child) = slot.as_mut() else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            log::debug!("sending SIGTERM to backend process {pid}");
            // Safety: plain kill(2) on a pid we own; worst case is ESRCH.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            return;
        }

        let _ = child.start_kill();
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("has_child", &self.inner.child.lock().unwrap().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Read stdout chunks, split complete lines out of the byte buffer, decode
/// each independently, and forward decoded events until EOF.
async fn read_events(mut stdout: ChildStdout, tx: mpsc::Sender<BackendEvent>) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_BYTES];

    loop {
        match stdout.read(&mut chunk).await {
            // EOF — a partial line left in `buffer` is dropped undecoded.
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                for line in drain_lines(&mut buffer) {
                    match BackendEvent::parse(&line) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                // Consumer is gone — stop reading.
                                return;
                            }
                        }
                        Err(e) => {
                            log::warn!("backend: dropping malformed event line: {e}");
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("backend: stdout read failed: {e}");
                break;
            }
        }
    }
}

/// Forward stderr lines until EOF.  Empty lines are skipped.
async fn read_logs(stderr: ChildStderr, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                log::warn!("backend: stderr read failed: {e}");
                return;
            }
        }
    }
}

/// After stdout closes, wait for the process to exit, synthesize an `error`
/// event for a non-zero status, and release the handle slots.
///
/// Joining the stdout reader first guarantees every real event is delivered
/// before the synthesized one; dropping `event_tx` at the end is what
/// terminates the event sequence.  Holding only a [`Weak`] keeps the runner's
/// drop semantics intact: if the runner goes away, this task just exits.
async fn watch_exit(
    inner: Weak<Inner>,
    stdout_reader: JoinHandle<()>,
    event_tx: mpsc::Sender<BackendEvent>,
) {
    let _ = stdout_reader.await;

    let mut status = None;
    loop {
        let Some(strong) = inner.upgrade() else {
            // Runner dropped — kill_on_drop reaps the child.
            return;
        };
        let polled = {
            let mut slot = strong.child.lock().unwrap();
            match slot.as_mut() {
                Some(child) => child.try_wait(),
                None => return,
            }
        };
        match polled {
            Ok(Some(s)) => {
                status = Some(s);
                break;
            }
            Ok(None) => {
                drop(strong);
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
            Err(e) => {
                log::warn!("backend: wait for exit failed: {e}");
                break;
            }
        }
    }

    if let Some(status) = status {
        if status.success() {
            log::debug!("backend process exited cleanly");
        } else {
            let message = match status.code() {
                Some(code) => format!("backend process exited with status {code}"),
                None => "backend process terminated by signal".to_owned(),
            };
            log::warn!("{message}");
            let _ = event_tx.send(BackendEvent::Error { message }).await;
        }
    }

    if let Some(strong) = inner.upgrade() {
        *strong.child.lock().unwrap() = None;
        *strong.stdin.lock().await = None;
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Split every complete newline-terminated line out of `buffer`, leaving any
/// trailing partial line in place for the next chunk.  Empty lines are
/// discarded.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// A pipe handle must exist when the child was spawned with `Stdio::piped()`.
fn take_pipe<T>(pipe: Option<T>, name: &str) -> Result<T, RunnerError> {
    pipe.ok_or_else(|| {
        RunnerError::Spawn(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("child {name} was not piped"),
        ))
    })
}

/// Map a stdin write failure: a broken pipe means the process went away.
fn map_write_error(e: std::io::Error) -> RunnerError {
    if e.kind() == std::io::ErrorKind::BrokenPipe {
        log::warn!("backend: stdin broken pipe — process exited");
        RunnerError::NotRunning
    } else {
        RunnerError::Write(e)
    }
}

/// An mpsc receiver whose sender is already gone — `recv` returns `None`
/// immediately.
fn closed_receiver<T>() -> mpsc::Receiver<T> {
    let (_tx, rx) = mpsc::channel(1);
    rx
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    /// Launch command for an inline shell-script mock backend.
    fn mock_backend(script: &str) -> LaunchCommand {
        LaunchCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: None,
            current_dir: None,
        }
    }

    /// Mock backend that emits `ready`, then echoes protocol events for each
    /// `start` command and exits on `shutdown` — the behaviour of the real
    /// server's happy path.
    fn echo_backend() -> LaunchCommand {
        mock_backend(
            r#"
printf '{"type":"ready"}\n'
echo 'INFO: mock backend ready' >&2
while IFS= read -r line; do
    case "$line" in
        *shutdown*) exit 0 ;;
        *start*)
            printf '{"type":"speech_started"}\n'
            printf '{"type":"transcription","text":"hello","is_final":true}\n'
            printf '{"type":"speech_ended"}\n'
            ;;
    esac
done
"#,
        )
    }

    async fn recv(rx: &mut mpsc::Receiver<BackendEvent>) -> Option<BackendEvent> {
        timeout(RECV_TIMEOUT, rx.recv()).await.expect("recv timed out")
    }

    // ---- drain_lines ---

    #[test]
    fn drain_lines_splits_complete_lines() {
        let mut buffer = b"{\"a\":1}\n{\"b\":2}\n".to_vec();
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
        assert!(buffer.is_empty());
    }

    /// A chunk ending mid-line yields only the complete line; the truncated
    /// remainder stays buffered for the rest of that line to arrive.
    #[test]
    fn drain_lines_buffers_truncated_remainder() {
        let mut buffer = b"{\"type\":\"ready\"}\n{\"type\":\"sp".to_vec();
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec![b"{\"type\":\"ready\"}".to_vec()]);
        assert_eq!(buffer, b"{\"type\":\"sp".to_vec());

        // The rest of the line arrives in a later chunk.
        buffer.extend_from_slice(b"eech_started\"}\n");
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec![b"{\"type\":\"speech_started\"}".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_lines_skips_empty_lines() {
        let mut buffer = b"\n\nx\n\n".to_vec();
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec![b"x".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_lines_without_newline_keeps_everything() {
        let mut buffer = b"partial".to_vec();
        assert!(drain_lines(&mut buffer).is_empty());
        assert_eq!(buffer, b"partial".to_vec());
    }

    // ---- lifecycle ---

    #[tokio::test]
    async fn start_receives_ready_event() {
        let runner = ProcessRunner::new();
        runner.start(echo_backend()).await.expect("start");

        let mut events = runner.events();
        assert_eq!(recv(&mut events).await, Some(BackendEvent::Ready));

        runner.terminate();
    }

    #[tokio::test]
    async fn send_start_receives_transcription_events() {
        let runner = ProcessRunner::new();
        runner.start(echo_backend()).await.expect("start");

        let mut events = runner.events();
        assert_eq!(recv(&mut events).await, Some(BackendEvent::Ready));

        runner.send(&BackendCommand::Start).await.expect("send");

        assert_eq!(recv(&mut events).await, Some(BackendEvent::SpeechStarted));
        assert_eq!(
            recv(&mut events).await,
            Some(BackendEvent::Transcription {
                text: "hello".into(),
                is_final: true,
            })
        );
        assert_eq!(recv(&mut events).await, Some(BackendEvent::SpeechEnded));

        runner.terminate();
    }

    #[tokio::test]
    async fn shutdown_command_ends_event_sequence() {
        let runner = ProcessRunner::new();
        runner.start(echo_backend()).await.expect("start");

        let mut events = runner.events();
        assert_eq!(recv(&mut events).await, Some(BackendEvent::Ready));

        runner.send(&BackendCommand::Shutdown).await.expect("send");

        // Clean exit: sequence terminates with no synthesized error.
        assert_eq!(recv(&mut events).await, None);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn second_start_fails_already_running() {
        let runner = ProcessRunner::new();
        runner
            .start(mock_backend("sleep 60"))
            .await
            .expect("first start");

        let result = runner.start(mock_backend("sleep 60")).await;
        assert!(matches!(result, Err(RunnerError::AlreadyRunning)));

        runner.terminate();
    }

    #[tokio::test]
    async fn send_without_start_fails_not_running() {
        let runner = ProcessRunner::new();
        let result = runner.send(&BackendCommand::Start).await;
        assert!(matches!(result, Err(RunnerError::NotRunning)));
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let runner = ProcessRunner::new();
        runner
            .start(mock_backend(
                r#"
printf 'this is not json\n'
printf '{"type":"time_warp"}\n'
printf '{"type":"ready"}\n'
sleep 60
"#,
            ))
            .await
            .expect("start");

        // Both bad lines are dropped; the first decoded event is `ready`.
        let mut events = runner.events();
        assert_eq!(recv(&mut events).await, Some(BackendEvent::Ready));

        runner.terminate();
    }

    #[tokio::test]
    async fn nonzero_exit_synthesizes_error_event() {
        let runner = ProcessRunner::new();
        runner
            .start(mock_backend(r#"printf '{"type":"ready"}\n'; exit 3"#))
            .await
            .expect("start");

        let mut events = runner.events();
        assert_eq!(recv(&mut events).await, Some(BackendEvent::Ready));

        match recv(&mut events).await {
            Some(BackendEvent::Error { message }) => {
                assert!(message.contains('3'), "got: {message}");
            }
            other => panic!("expected synthesized error event, got {other:?}"),
        }

        // …and then the sequence terminates.
        assert_eq!(recv(&mut events).await, None);
    }

    #[tokio::test]
    async fn stderr_lines_surface_as_logs() {
        let runner = ProcessRunner::new();
        runner.start(echo_backend()).await.expect("start");

        let mut logs = runner.logs();
        let line = timeout(RECV_TIMEOUT, logs.recv())
            .await
            .expect("log recv timed out")
            .expect("log stream ended");
        assert!(line.contains("mock backend ready"), "got: {line}");

        runner.terminate();
    }

    #[tokio::test]
    async fn events_can_only_be_taken_once() {
        let runner = ProcessRunner::new();
        runner.start(echo_backend()).await.expect("start");

        let _live = runner.events();
        let mut second = runner.events();
        assert_eq!(second.recv().await, None);

        runner.terminate();
    }

    #[tokio::test]
    async fn events_before_start_is_closed() {
        let runner = ProcessRunner::new();
        let mut events = runner.events();
        assert_eq!(events.recv().await, None);
        let mut logs = runner.logs();
        assert_eq!(logs.recv().await, None);
    }

    #[tokio::test]
    async fn terminate_stops_the_process() {
        let runner = ProcessRunner::new();
        runner
            .start(mock_backend("sleep 60"))
            .await
            .expect("start");
        assert!(runner.is_running());

        runner.terminate();

        // Drain the event sequence — it terminates once the process dies.
        let mut events = runner.events();
        while timeout(RECV_TIMEOUT, events.recv())
            .await
            .expect("recv timed out")
            .is_some()
        {}
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn is_running_reflects_exit() {
        let runner = ProcessRunner::new();
        runner.start(mock_backend("exit 0")).await.expect("start");

        let mut events = runner.events();
        assert_eq!(recv(&mut events).await, None);
        assert!(!runner.is_running());
    }

    /// A fresh start is accepted after the previous process has exited and
    /// the exit watcher released the handle.
    #[tokio::test]
    async fn restart_after_exit_is_accepted() {
        let runner = ProcessRunner::new();
        runner.start(mock_backend("exit 0")).await.expect("start");

        let mut events = runner.events();
        assert_eq!(recv(&mut events).await, None);

        // The watcher clears the slot shortly after the stream ends.
        let deadline = std::time::Instant::now() + RECV_TIMEOUT;
        loop {
            match runner.start(echo_backend()).await {
                Ok(()) => break,
                Err(RunnerError::AlreadyRunning) if std::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("restart failed: {e}"),
            }
        }

        let mut events = runner.events();
        assert_eq!(recv(&mut events).await, Some(BackendEvent::Ready));
        runner.terminate();
    }

    #[tokio::test]
    async fn runner_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProcessRunner>();
    }
}
