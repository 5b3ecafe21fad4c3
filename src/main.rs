//! Application entry point — speak-pilot.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (returns default on first run).
//! 3. Create [`tokio`] runtime (multi-thread, 2 workers).
//! 4. Build the shared backend state and channels.
//! 5. Spawn the control task: launches the backend, then handles hotkey
//!    toggles until the app quits, ending with a graceful shutdown.
//! 6. Spawn the inserter task: pastes every final transcription.
//! 7. Spawn the hotkey listener thread.
//! 8. Run [`eframe::run_native`] — blocks the main thread until the window
//!    is closed — then wait for the control task's shutdown to finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eframe::egui;
use tokio::sync::{mpsc, oneshot};

use speak_pilot::{
    app::SpeakPilotApp,
    backend::{
        new_shared_state, BackendManager, BackendState, DefaultCommandResolver, TranscriptUpdate,
    },
    config::AppConfig,
    hotkey::{parse_key, HotkeyEvent, HotkeyListener},
    inject::TextInjector,
};

// ---------------------------------------------------------------------------
// Control task
// ---------------------------------------------------------------------------

/// Launch the backend, then service hotkey toggles until quit is signalled.
///
/// Owns the [`BackendManager`] for its whole life, so lifecycle calls and
/// quit handling are naturally serialized.
async fn run_control(
    mut manager: BackendManager,
    mut hotkey_rx: mpsc::Receiver<HotkeyEvent>,
    visible: Arc<AtomicBool>,
    mut quit_rx: oneshot::Receiver<()>,
) {
    if let Err(e) = manager.launch().await {
        // State is already Error(…) — the widget shows it; the hotkey can
        // retry the launch.
        log::error!("backend launch failed: {e}");
    }

    loop {
        tokio::select! {
            _ = &mut quit_rx => break,
            event = hotkey_rx.recv() => match event {
                Some(HotkeyEvent::ToggleListening) => toggle_listening(&mut manager).await,
                Some(HotkeyEvent::ToggleVisibility) => {
                    let now_visible = !visible.load(Ordering::Relaxed);
                    visible.store(now_visible, Ordering::Relaxed);
                    log::debug!("widget visibility toggled: {now_visible}");
                }
                None => break,
            },
        }
    }

    manager.shutdown().await;
}

/// One hotkey press: start from `Ready`, stop from `Listening`, relaunch
/// from `Idle`/`Error`.
async fn toggle_listening(manager: &mut BackendManager) {
    match manager.state() {
        BackendState::Ready => {
            if let Err(e) = manager.start_listening().await {
                log::error!("failed to start listening: {e}");
            }
        }
        BackendState::Listening => {
            if let Err(e) = manager.stop_listening().await {
                log::error!("failed to stop listening: {e}");
            }
        }
        BackendState::Idle | BackendState::Error(_) => {
            log::info!("hotkey pressed while backend inactive — launching");
            if let Err(e) = manager.launch().await {
                log::error!("backend launch failed: {e}");
            }
        }
        BackendState::Starting => {
            log::warn!("hotkey ignored while backend is starting");
        }
    }
}

// ---------------------------------------------------------------------------
// Inserter task
// ---------------------------------------------------------------------------

/// Paste every final transcription into the focused application.
///
/// Clipboard and key-event work is blocking, so each insertion runs on the
/// blocking thread pool.  Injection failures are logged, never fatal.
async fn run_inserter(
    mut update_rx: mpsc::Receiver<TranscriptUpdate>,
    injector: TextInjector,
    auto_insert: bool,
) {
    while let Some(update) = update_rx.recv().await {
        let TranscriptUpdate::Final(text) = update else {
            continue;
        };
        let trimmed = text.trim().to_owned();
        if trimmed.is_empty() {
            continue;
        }
        if !auto_insert {
            log::debug!("auto_insert disabled — skipping injection");
            continue;
        }

        let char_count = trimmed.chars().count();
        let injector = injector.clone();
        match tokio::task::spawn_blocking(move || injector.inject(&trimmed)).await {
            Ok(Ok(())) => log::info!("inserted transcription ({char_count} chars)"),
            Ok(Err(e)) => log::warn!("text injection failed: {e}"),
            Err(e) => log::warn!("inject task panicked: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Native options builder
// ---------------------------------------------------------------------------

fn native_options(config: &AppConfig) -> eframe::NativeOptions {
    let mut vp = egui::ViewportBuilder::default()
        .with_decorations(false)
        .with_transparent(true)
        .with_inner_size([320.0, 96.0])
        .with_min_inner_size([250.0, 50.0])
        .with_resizable(false);

    if config.ui.always_on_top {
        vp = vp.with_always_on_top();
    }

    if let Some((x, y)) = config.ui.window_position {
        vp = vp.with_position(egui::pos2(x, y));
    }

    eframe::NativeOptions {
        viewport: vp,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> eframe::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("speak-pilot starting up");

    // 2. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });

    // 3. Tokio runtime (2 workers — backend I/O and insertion)
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    // 4. Shared state + channels
    let shared = new_shared_state();
    let visible = Arc::new(AtomicBool::new(true));
    let (hotkey_tx, hotkey_rx) = mpsc::channel::<HotkeyEvent>(16);
    let (update_tx, update_rx) = mpsc::channel::<TranscriptUpdate>(32);
    let (quit_tx, quit_rx) = oneshot::channel::<()>();

    // 5. Backend manager + control task
    let resolver = Arc::new(DefaultCommandResolver::new(config.backend.clone()));
    let manager = BackendManager::new(Arc::clone(&shared), resolver, update_tx)
        .with_startup_timeout(Duration::from_secs(config.backend.startup_timeout_secs));
    let control_task = rt.spawn(run_control(
        manager,
        hotkey_rx,
        Arc::clone(&visible),
        quit_rx,
    ));

    // 6. Inserter task
    let injector = TextInjector::from_config(&config.inject);
    rt.spawn(run_inserter(update_rx, injector, config.inject.auto_insert));

    // 7. Hotkey listener thread
    let mut bindings = Vec::new();
    match parse_key(&config.hotkey.toggle_listening_key) {
        Some(key) => bindings.push((key, HotkeyEvent::ToggleListening)),
        None => {
            log::warn!(
                "unknown toggle_listening_key {:?}; falling back to F9",
                config.hotkey.toggle_listening_key
            );
            bindings.push((rdev::Key::F9, HotkeyEvent::ToggleListening));
        }
    }
    if let Some(key) = parse_key(&config.hotkey.toggle_visibility_key) {
        bindings.push((key, HotkeyEvent::ToggleVisibility));
    }
    let _hotkey_listener = HotkeyListener::start(bindings, hotkey_tx);

    // 8. Run the widget (blocks until the window is closed)
    let app = SpeakPilotApp::new(Arc::clone(&shared), Arc::clone(&visible), &config);
    let options = native_options(&config);
    let result = eframe::run_native("speak-pilot", options, Box::new(move |_cc| Ok(Box::new(app))));

    // Window closed — shut the backend down before the runtime drops.
    let _ = quit_tx.send(());
    let _ = rt.block_on(control_task);
    log::info!("speak-pilot exited");

    result
}
