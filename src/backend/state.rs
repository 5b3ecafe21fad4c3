//! Backend state machine types and shared observable state.
//!
//! [`BackendState`] drives the backend manager's state machine.  The UI reads
//! it via [`SharedBackendState`] to render the appropriate widget view.
//!
//! [`BackendShared`] is the single source of truth the UI needs: the current
//! state and the latest transcription text (partial or final).
//!
//! [`SharedBackendState`] is a type alias for `Arc<Mutex<BackendShared>>` —
//! cheap to clone and safe to share across threads.  Only the backend manager
//! mutates it; everyone else reads.

use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// FailureKind / Failure
// ---------------------------------------------------------------------------

/// Category of a backend failure, so consumers can branch without string
/// matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The launch command could not be resolved (no executable, no project).
    Resolve,
    /// The OS refused to spawn the backend process.
    Spawn,
    /// The backend reported an error event over the protocol.
    Child,
    /// The backend process exited without being asked to.
    ProcessExit,
    /// The backend produced no `ready` event within the startup timeout.
    StartupTimeout,
}

/// A failure that put the backend into [`BackendState::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// What category of thing went wrong.
    pub kind: FailureKind,
    /// Human-readable description for the UI / logs.
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ---------------------------------------------------------------------------
// BackendState
// ---------------------------------------------------------------------------

/// States of the backend process lifecycle.
///
/// The state machine transitions are:
///
/// ```text
/// Idle ──launch()──▶ Starting ──ready event──▶ Ready
///                        │                      │  ▲
///                        │        start_listening  │ stop_listening
///                        │                      ▼  │
///                        │                    Listening
///                        └──error/timeout──▶ Error(…) ◀── error event /
///                                               │        unexpected exit
///                                               └──launch() retry──▶ Starting
/// any state ──shutdown()──▶ Idle
/// ```
///
/// `Listening` is reachable only from `Ready`, and only after the `start`
/// command has actually been written to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendState {
    /// No backend process exists.
    Idle,
    /// The process has been spawned; waiting for its `ready` event.
    Starting,
    /// The backend is initialised and idle, ready to listen.
    Ready,
    /// The backend is capturing audio and streaming transcriptions.
    Listening,
    /// Something failed — see the carried [`Failure`].  Recoverable by a new
    /// `launch()`.
    Error(Failure),
}

impl BackendState {
    /// Returns `true` while a backend process is supposed to be alive.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BackendState::Starting | BackendState::Ready | BackendState::Listening
        )
    }

    /// Returns `true` for the error state, regardless of failure kind.
    pub fn is_error(&self) -> bool {
        matches!(self, BackendState::Error(_))
    }

    /// A short human-readable label suitable for the UI status line.
    pub fn label(&self) -> &'static str {
        match self {
            BackendState::Idle => "Idle",
            BackendState::Starting => "Starting…",
            BackendState::Ready => "Ready",
            BackendState::Listening => "Listening",
            BackendState::Error(_) => "Error",
        }
    }
}

impl Default for BackendState {
    fn default() -> Self {
        BackendState::Idle
    }
}

// ---------------------------------------------------------------------------
// BackendShared / SharedBackendState
// ---------------------------------------------------------------------------

/// Shared observable backend state — the single source of truth for the UI.
///
/// Held behind [`SharedBackendState`] (`Arc<Mutex<BackendShared>>`).  The
/// backend manager mutates it; the egui update loop reads it each frame.
#[derive(Debug, Default)]
pub struct BackendShared {
    /// Current lifecycle state.
    pub state: BackendState,
    /// The latest transcription text (partial or final).  Empty when nothing
    /// has been recognised since the last `stop_listening` / `shutdown`.
    pub transcription: String,
}

/// Thread-safe handle to [`BackendShared`].
///
/// Cheap to clone (`Arc` clone).  Lock for a short critical section; do
/// **not** hold the lock across `.await` points.
pub type SharedBackendState = Arc<Mutex<BackendShared>>;

/// Construct a new [`SharedBackendState`] starting out `Idle`.
pub fn new_shared_state() -> SharedBackendState {
    Arc::new(Mutex::new(BackendShared::default()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ---- BackendState::is_active ---

    #[test]
    fn idle_is_not_active() {
        assert!(!BackendState::Idle.is_active());
    }

    #[test]
    fn starting_ready_listening_are_active() {
        assert!(BackendState::Starting.is_active());
        assert!(BackendState::Ready.is_active());
        assert!(BackendState::Listening.is_active());
    }

    #[test]
    fn error_is_not_active() {
        let state = BackendState::Error(Failure::new(FailureKind::Child, "boom"));
        assert!(!state.is_active());
        assert!(state.is_error());
    }

    // ---- labels ---

    #[test]
    fn labels() {
        assert_eq!(BackendState::Idle.label(), "Idle");
        assert_eq!(BackendState::Starting.label(), "Starting…");
        assert_eq!(BackendState::Ready.label(), "Ready");
        assert_eq!(BackendState::Listening.label(), "Listening");
        assert_eq!(
            BackendState::Error(Failure::new(FailureKind::Spawn, "x")).label(),
            "Error"
        );
    }

    // ---- Failure ---

    #[test]
    fn failure_carries_kind_and_message() {
        let failure = Failure::new(FailureKind::StartupTimeout, "no ready within 30s");
        assert_eq!(failure.kind, FailureKind::StartupTimeout);
        assert_eq!(failure.to_string(), "no ready within 30s");
    }

    #[test]
    fn failures_with_same_kind_and_message_are_equal() {
        assert_eq!(
            Failure::new(FailureKind::Child, "a"),
            Failure::new(FailureKind::Child, "a")
        );
        assert_ne!(
            Failure::new(FailureKind::Child, "a"),
            Failure::new(FailureKind::ProcessExit, "a")
        );
    }

    // ---- shared state ---

    #[test]
    fn default_shared_state_is_idle_and_empty() {
        let shared = new_shared_state();
        let inner = shared.lock().unwrap();
        assert_eq!(inner.state, BackendState::Idle);
        assert!(inner.transcription.is_empty());
    }

    #[test]
    fn shared_state_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SharedBackendState>();
    }

    #[test]
    fn shared_state_can_be_cloned_and_mutated() {
        let shared = new_shared_state();
        let shared2 = Arc::clone(&shared);

        shared.lock().unwrap().state = BackendState::Listening;
        assert_eq!(shared2.lock().unwrap().state, BackendState::Listening);
    }
}
