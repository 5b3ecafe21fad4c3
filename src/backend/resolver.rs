//! Resolution of the backend launch command.
//!
//! The STT backend is a Python package run through `uv`.  Locating `uv` and
//! the backend project directory is pure configuration lookup, kept behind
//! the [`CommandResolver`] trait so the backend manager can be tested with a
//! mock resolver pointing at a fixture script.
//!
//! [`DefaultCommandResolver`] resolution order:
//!
//! 1. An explicit `[backend] executable = "…"` config override wins outright.
//! 2. Otherwise find `uv` (common install paths, then a `PATH` lookup via the
//!    `which` crate), walk up from the running executable to the project root
//!    containing `stt-stdio-server/`, and build
//!    `uv run --project <dir> python -m speak_pilot_stt_stdio`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::BackendConfig;

// ---------------------------------------------------------------------------
// ResolveError
// ---------------------------------------------------------------------------

/// Errors raised while constructing the backend launch command.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The launcher executable was not found anywhere.
    #[error("executable '{name}' not found — check your PATH or set [backend] executable")]
    ExecutableNotFound { name: String },

    /// No `stt-stdio-server/` directory exists above the running executable.
    #[error("stt-stdio-server/ directory not found — run from the project tree or set [backend] executable")]
    ProjectDirNotFound,
}

// ---------------------------------------------------------------------------
// LaunchCommand
// ---------------------------------------------------------------------------

/// A fully resolved command line for spawning the backend process.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    /// Path to the executable.
    pub program: PathBuf,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Environment override — `None` inherits the host environment as-is.
    pub env: Option<HashMap<String, String>>,
    /// Working directory — `None` inherits the host working directory.
    pub current_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// CommandResolver
// ---------------------------------------------------------------------------

/// Object-safe, thread-safe source of the backend launch command.
///
/// The backend manager holds an `Arc<dyn CommandResolver>` and resolves at
/// every `launch()`, so a retry picks up config/tooling changes.
pub trait CommandResolver: Send + Sync {
    /// Produce the command to spawn, or a [`ResolveError`] if the backend
    /// cannot be located.
    fn resolve(&self) -> Result<LaunchCommand, ResolveError>;
}

// ---------------------------------------------------------------------------
// DefaultCommandResolver
// ---------------------------------------------------------------------------

/// Production resolver: config override, else `uv run` against the project
/// directory found by walking up from the running executable.
pub struct DefaultCommandResolver {
    config: BackendConfig,
}

/// Directory name the walk-up search looks for.
const PROJECT_DIR_NAME: &str = "stt-stdio-server";

/// Python module executed inside the project's environment.
const BACKEND_MODULE: &str = "speak_pilot_stt_stdio";

/// How many parent directories the walk-up search visits before giving up.
const MAX_WALK_UP: usize = 10;

impl DefaultCommandResolver {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

impl CommandResolver for DefaultCommandResolver {
    fn resolve(&self) -> Result<LaunchCommand, ResolveError> {
        // 1. Explicit override from settings.toml.
        if let Some(executable) = &self.config.executable {
            return Ok(LaunchCommand {
                program: PathBuf::from(executable),
                args: self.config.args.clone(),
                env: None,
                current_dir: self.config.working_dir.clone(),
            });
        }

        // 2. uv + project-directory discovery.
        let uv = find_executable("uv")?;
        let start = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .ok_or(ResolveError::ProjectDirNotFound)?;
        let project_dir = find_project_dir_from(&start).ok_or(ResolveError::ProjectDirNotFound)?;

        let args = vec![
            "run".to_owned(),
            "--project".to_owned(),
            project_dir.display().to_string(),
            "python".to_owned(),
            "-m".to_owned(),
            BACKEND_MODULE.to_owned(),
        ];

        Ok(LaunchCommand {
            program: uv,
            args,
            // `uv run --project` must create its own virtual environment, not
            // reuse an externally pinned one where the backend package is not
            // installed.
            env: Some(inherited_env_without("UV_PROJECT_ENVIRONMENT")),
            current_dir: Some(project_dir),
        })
    }
}

// ---------------------------------------------------------------------------
// Lookup helpers
// ---------------------------------------------------------------------------

/// Locate `name` in the common install locations, falling back to a `PATH`
/// search via the `which` crate.
fn find_executable(name: &str) -> Result<PathBuf, ResolveError> {
    let common = [
        format!("/usr/local/bin/{name}"),
        format!("/opt/homebrew/bin/{name}"),
        format!("/usr/bin/{name}"),
    ];
    for candidate in &common {
        let path = Path::new(candidate);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
    }

    which::which(name).map_err(|_| ResolveError::ExecutableNotFound {
        name: name.to_owned(),
    })
}

/// Walk up from `start` looking for a directory named `stt-stdio-server`,
/// visiting at most [`MAX_WALK_UP`] ancestors.
fn find_project_dir_from(start: &Path) -> Option<PathBuf> {
    let mut search_dir = start.to_path_buf();
    for _ in 0..MAX_WALK_UP {
        let candidate = search_dir.join(PROJECT_DIR_NAME);
        if candidate.is_dir() {
            return Some(candidate);
        }
        if !search_dir.pop() {
            break;
        }
    }
    None
}

/// Snapshot the host environment minus one variable.
fn inherited_env_without(name: &str) -> HashMap<String, String> {
    std::env::vars().filter(|(key, _)| key != name).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
