//! Backend lifecycle orchestration — the state machine over [`ProcessRunner`].
//!
//! [`BackendManager`] owns at most one runner at a time and drives
//! [`BackendState`] from two directions:
//!
//! * lifecycle calls (`launch`, `start_listening`, `stop_listening`,
//!   `shutdown`) issued by the control task, and
//! * the backend's event sequence, consumed by a spawned event loop.
//!
//! Both mutate the state only under the shared mutex, so transitions are
//! serialized even though they originate on different tasks.  The event loop
//! and the stderr log loop are aborted as a pair at every teardown path.
//!
//! # Readiness wait
//!
//! `launch()` awaits readiness with a bounded 50 ms poll against the shared
//! state rather than a one-shot receive, so a startup timeout and an
//! error-during-startup share a single wait path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{BackendCommand, BackendEvent};

use super::resolver::{CommandResolver, ResolveError};
use super::runner::{ProcessRunner, RunnerError};
use super::state::{BackendState, Failure, FailureKind, SharedBackendState};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default deadline for the backend's `ready` event after spawn.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval of the readiness wait loop.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Fixed wait after the `shutdown` command before force-terminating.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// BackendError
// ---------------------------------------------------------------------------

/// Errors surfaced by [`BackendManager`] lifecycle operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The launch command could not be resolved.
    #[error("cannot resolve backend launch command: {0}")]
    Resolve(#[from] ResolveError),

    /// A process-runner operation failed (spawn, write, …).
    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// No `ready` event arrived within the startup timeout.
    #[error("backend produced no ready event within {0:?}")]
    StartupTimeout(Duration),

    /// The backend reported an error (or exited) before becoming ready.
    #[error("backend failed during startup: {0}")]
    StartupFailed(String),
}

// ---------------------------------------------------------------------------
// TranscriptUpdate
// ---------------------------------------------------------------------------

/// Notifications emitted on every transcription event the backend delivers.
///
/// `Final` carries text the user finished speaking — the inserter pastes it
/// into the focused application.  `Partial` is display-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptUpdate {
    /// An in-progress hypothesis; replaces the previous partial text.
    Partial(String),
    /// A finalized utterance.
    Final(String),
}

// ---------------------------------------------------------------------------
// BackendManager
// ---------------------------------------------------------------------------

/// Drives the backend process lifecycle and owns its observable state.
///
/// Construct with [`BackendManager::new`], then call lifecycle methods from a
/// single control task.  The UI observes [`SharedBackendState`]; the
/// inserter consumes [`TranscriptUpdate`]s from the channel handed to `new`.
pub struct BackendManager {
    shared: SharedBackendState,
    resolver: Arc<dyn CommandResolver>,
    update_tx: mpsc::Sender<TranscriptUpdate>,
    runner: Option<ProcessRunner>,
    event_task: Option<JoinHandle<()>>,
    log_task: Option<JoinHandle<()>>,
    /// Set before the `shutdown` command is written, so an exit observed
    /// during the grace window is not reported as unexpected.
    expecting_exit: Arc<AtomicBool>,
    startup_timeout: Duration,
}

impl BackendManager {
    /// Create a manager in `Idle` with no process attached.
    pub fn new(
        shared: SharedBackendState,
        resolver: Arc<dyn CommandResolver>,
        update_tx: mpsc::Sender<TranscriptUpdate>,
    ) -> Self {
        Self {
            shared,
            resolver,
            update_tx,
            runner: None,
            event_task: None,
            log_task: None,
            expecting_exit: Arc::new(AtomicBool::new(false)),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Override the startup timeout (config-driven; short values in tests).
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> BackendState {
        self.shared.lock().unwrap().state.clone()
    }

    /// Snapshot of the current transcription text.
    pub fn current_transcription(&self) -> String {
        self.shared.lock().unwrap().transcription.clone()
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Launch the backend process and wait until it becomes ready.
    ///
    /// Allowed from `Idle` or `Error` (a retry); from any other state this is
    /// a logged no-op.  On success the state is `Ready`.  On failure the
    /// state is `Error(…)` and the error is also returned, so a later
    /// `launch()` is always accepted again.
    pub async fn launch(&mut self) -> Result<(), BackendError> {
        {
            let shared = self.shared.lock().unwrap();
            if !matches!(shared.state, BackendState::Idle | BackendState::Error(_)) {
                log::warn!("launch() called in state {:?} — ignored", shared.state);
                return Ok(());
            }
        }

        // A retry from `Error` may leave a previous runner behind (the child
        // can outlive a child-reported error).  Tear it down first.
        self.release_runner();

        self.set_state(BackendState::Starting);
        self.clear_transcription();
        self.expecting_exit.store(false, Ordering::SeqCst);

        let command = match self.resolver.resolve() {
            Ok(command) => command,
            Err(e) => {
                self.fail(FailureKind::Resolve, e.to_string());
                return Err(e.into());
            }
        };
        log::info!(
            "launching backend: {} {}",
            command.program.display(),
            command.args.join(" ")
        );

        let runner = ProcessRunner::new();
        if let Err(e) = runner.start(command).await {
            self.fail(FailureKind::Spawn, e.to_string());
            return Err(e.into());
        }

        let events = runner.events();
        let logs = runner.logs();
        self.runner = Some(runner);
        self.event_task = Some(tokio::spawn(run_event_loop(
            Arc::clone(&self.shared),
            self.update_tx.clone(),
            Arc::clone(&self.expecting_exit),
            events,
        )));
        self.log_task = Some(tokio::spawn(run_log_loop(logs)));

        self.wait_for_ready().await
    }

    /// Send `start` and enter `Listening`.
    ///
    /// Optimistic: the transition happens as soon as the command has been
    /// written — the backend is not awaited for an acknowledgement.  Allowed
    /// only from `Ready`; otherwise a logged no-op.
    pub async fn start_listening(&mut self) -> Result<(), BackendError> {
        {
            let shared = self.shared.lock().unwrap();
            if shared.state != BackendState::Ready {
                log::warn!(
                    "start_listening() called in state {:?} — ignored",
                    shared.state
                );
                return Ok(());
            }
        }

        let runner = self.runner.as_ref().ok_or(RunnerError::NotRunning)?;
        runner.send(&BackendCommand::Start).await?;
        self.set_state(BackendState::Listening);
        log::info!("listening started");
        Ok(())
    }

    /// Send `stop`, return to `Ready`, and clear the transcription buffer.
    ///
    /// Allowed only from `Listening`; otherwise a logged no-op.
    pub async fn stop_listening(&mut self) -> Result<(), BackendError> {
        {
            let shared = self.shared.lock().unwrap();
            if shared.state != BackendState::Listening {
                log::warn!(
                    "stop_listening() called in state {:?} — ignored",
                    shared.state
                );
                return Ok(());
            }
        }

        let runner = self.runner.as_ref().ok_or(RunnerError::NotRunning)?;
        runner.send(&BackendCommand::Stop).await?;
        {
            let mut shared = self.shared.lock().unwrap();
            shared.state = BackendState::Ready;
            shared.transcription.clear();
        }
        log::info!("listening stopped");
        Ok(())
    }

    /// Gracefully shut the backend down, escalating to forced termination.
    ///
    /// Idempotent; a no-op when no process is active.  Never fails outward —
    /// every internal error is absorbed so the manager reliably ends in
    /// `Idle` with the process handle released.
    pub async fn shutdown(&mut self) {
        let Some(runner) = self.runner.take() else {
            return;
        };
        log::info!("shutting down backend");

        // Mark the exit as expected *before* the command goes out, so the
        // exit racing the grace window is never flagged as unexpected.
        self.expecting_exit.store(true, Ordering::SeqCst);

        if let Err(e) = runner.send(&BackendCommand::Shutdown).await {
            log::warn!("failed to send shutdown command: {e}");
        }

        self.abort_listeners();
        tokio::time::sleep(SHUTDOWN_GRACE).await;

        if runner.is_running() {
            log::warn!("backend still running after grace period — terminating");
            runner.terminate();
        }
        // Dropping the runner reaps the child even if SIGTERM was ignored.
        drop(runner);

        {
            let mut shared = self.shared.lock().unwrap();
            shared.state = BackendState::Idle;
            shared.transcription.clear();
        }
        log::info!("backend shut down");
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    /// Poll the shared state until it leaves `Starting`, up to the timeout.
    async fn wait_for_ready(&mut self) -> Result<(), BackendError> {
        let deadline = tokio::time::Instant::now() + self.startup_timeout;

        loop {
            match self.state() {
                BackendState::Starting => {
                    if tokio::time::Instant::now() >= deadline {
                        self.release_runner();
                        self.fail(
                            FailureKind::StartupTimeout,
                            format!("no ready event within {:?}", self.startup_timeout),
                        );
                        return Err(BackendError::StartupTimeout(self.startup_timeout));
                    }
                    tokio::time::sleep(READY_POLL_INTERVAL).await;
                }
                BackendState::Ready | BackendState::Listening => {
                    log::info!("backend is ready");
                    return Ok(());
                }
                BackendState::Error(failure) => {
                    self.release_runner();
                    // Keep the error state the event loop recorded.
                    return Err(BackendError::StartupFailed(failure.message));
                }
                BackendState::Idle => {
                    // A concurrent shutdown() won the race.
                    return Err(BackendError::StartupFailed(
                        "backend was shut down during startup".into(),
                    ));
                }
            }
        }
    }

    /// Abort both consumption loops as a pair.
    fn abort_listeners(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        if let Some(task) = self.log_task.take() {
            task.abort();
        }
    }

    /// Abort the loops and drop the runner, terminating a still-live child.
    fn release_runner(&mut self) {
        self.abort_listeners();
        if let Some(runner) = self.runner.take() {
            if runner.is_running() {
                runner.terminate();
            }
        }
    }

    fn set_state(&self, state: BackendState) {
        self.shared.lock().unwrap().state = state;
    }

    fn clear_transcription(&self) {
        self.shared.lock().unwrap().transcription.clear();
    }

    fn fail(&self, kind: FailureKind, message: String) {
        log::error!("backend failure: {message}");
        self.shared.lock().unwrap().state = BackendState::Error(Failure::new(kind, message));
    }
}

// ---------------------------------------------------------------------------
// Event / log loops
// ---------------------------------------------------------------------------

/// Drain the event sequence, driving state transitions and transcript
/// notifications; flag an unexpected exit when the sequence ends.
async fn run_event_loop(
    shared: SharedBackendState,
    update_tx: mpsc::Sender<TranscriptUpdate>,
    expecting_exit: Arc<AtomicBool>,
    mut events: mpsc::Receiver<BackendEvent>,
) {
    while let Some(event) = events.recv().await {
        if let Some(update) = apply_event(&shared, event) {
            // The inserter going away is not a state-machine concern.
            let _ = update_tx.send(update).await;
        }
    }

    // Sequence exhausted — the process exited.
    if expecting_exit.load(Ordering::SeqCst) {
        return;
    }
    let mut shared = shared.lock().unwrap();
    if !matches!(shared.state, BackendState::Idle | BackendState::Error(_)) {
        log::warn!(
            "backend process exited unexpectedly in state {:?}",
            shared.state
        );
        shared.state = BackendState::Error(Failure::new(
            FailureKind::ProcessExit,
            "backend process exited unexpectedly",
        ));
    }
}

/// Apply one event to the shared state; returns the notification to emit.
fn apply_event(shared: &SharedBackendState, event: BackendEvent) -> Option<TranscriptUpdate> {
    let mut shared = shared.lock().unwrap();
    match event {
        BackendEvent::Ready => {
            if shared.state == BackendState::Starting {
                shared.state = BackendState::Ready;
            }
            None
        }
        BackendEvent::SpeechStarted => {
            log::debug!("speech started");
            None
        }
        BackendEvent::SpeechEnded => {
            log::debug!("speech ended");
            None
        }
        BackendEvent::Transcription { text, is_final } => {
            shared.transcription = text.clone();
            if is_final {
                log::info!("final transcription: {text}");
                Some(TranscriptUpdate::Final(text))
            } else {
                Some(TranscriptUpdate::Partial(text))
            }
        }
        BackendEvent::Error { message } => {
            log::error!("backend error: {message}");
            shared.state = BackendState::Error(Failure::new(FailureKind::Child, message));
            None
        }
    }
}

/// Forward backend stderr lines into the host log.
async fn run_log_loop(mut logs: mpsc::Receiver<String>) {
    while let Some(line) = logs.recv().await {
        log::info!("[backend] {line}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
