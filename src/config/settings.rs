//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// BackendConfig
// ---------------------------------------------------------------------------

/// Settings for launching the STT backend process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Explicit backend executable.  `None` lets the resolver discover `uv`
    /// and the backend project directory on its own.
    pub executable: Option<String>,
    /// Arguments passed to the explicit executable.  Ignored unless
    /// `executable` is set.
    pub args: Vec<String>,
    /// Working directory for the explicit executable.  Ignored unless
    /// `executable` is set.
    pub working_dir: Option<PathBuf>,
    /// Seconds to wait for the backend's `ready` event before giving up.
    pub startup_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            working_dir: None,
            startup_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// HotkeyConfig
// ---------------------------------------------------------------------------

/// Global hotkey bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotkeyConfig {
    /// Key that toggles listening on/off (e.g. `"F9"`).
    pub toggle_listening_key: String,
    /// Key that shows/hides the floating widget (e.g. `"F10"`).
    pub toggle_visibility_key: String,
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            toggle_listening_key: "F9".into(),
            toggle_visibility_key: "F10".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// InjectConfig
// ---------------------------------------------------------------------------

/// Text-insertion behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectConfig {
    /// Paste every final transcription into the focused application.  When
    /// `false` the text only appears in the widget.
    pub auto_insert: bool,
    /// Milliseconds between setting the clipboard and simulating paste.
    pub delay_ms: u64,
    /// Milliseconds between simulating paste and restoring the clipboard.
    pub restore_delay_ms: u64,
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            auto_insert: true,
            delay_ms: 50,
            restore_delay_ms: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// UiConfig
// ---------------------------------------------------------------------------

/// egui widget appearance and behaviour settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiConfig {
    /// Last saved widget position `(x, y)` in screen pixels.  `None` means
    /// let the OS / window manager pick a position on first launch.
    pub window_position: Option<(f32, f32)>,
    /// Keep the widget floating above all other windows.
    pub always_on_top: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            window_position: None,
            always_on_top: true,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use speak_pilot::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Backend launch settings.
    pub backend: BackendConfig,
    /// Global hotkey bindings.
    pub hotkey: HotkeyConfig,
    /// Text-insertion settings.
    pub inject: InjectConfig,
    /// UI / widget settings.
    pub ui: UiConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet
    /// (first-run scenario) so callers never need to special-case a missing
    /// file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
