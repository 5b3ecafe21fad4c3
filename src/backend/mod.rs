//! STT backend process management.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       BackendManager                         │
//! │   state machine: Idle → Starting → Ready ⇄ Listening         │
//! │                     └───────▶ Error(Failure) ──retry──┐      │
//! │                                                        ▼     │
//! │  launch / start_listening / stop_listening / shutdown        │
//! └──────────────┬──────────────────────────────┬────────────────┘
//!                │ commands (stdin)             │ events + logs
//!                ▼                              │ (stdout/stderr)
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ProcessRunner                         │
//! │   one child process, three pipes, two reader tasks,          │
//! │   exit watcher synthesizing an error on non-zero exit        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager is the sole consumer of the runner's sequences and the sole
//! producer of its commands.  The UI and the text inserter only ever see
//! [`SharedBackendState`] and [`TranscriptUpdate`] — never the process
//! handle or the wire protocol.
//!
//! The launch command comes from a [`CommandResolver`], injected so tests
//! can point the whole stack at a shell-script mock backend.

pub mod manager;
pub mod resolver;
pub mod runner;
pub mod state;

pub use manager::{BackendError, BackendManager, TranscriptUpdate, DEFAULT_STARTUP_TIMEOUT};
pub use resolver::{CommandResolver, DefaultCommandResolver, LaunchCommand, ResolveError};
pub use runner::{ProcessRunner, RunnerError};
pub use state::{
    new_shared_state, BackendShared, BackendState, Failure, FailureKind, SharedBackendState,
};
