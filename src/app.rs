//! Floating status widget — egui/eframe application.
//!
//! # Architecture
//!
//! [`SpeakPilotApp`] is the top-level [`eframe::App`].  It owns no backend
//! logic: each frame it reads the [`SharedBackendState`] the backend manager
//! maintains and renders the matching view.  All control flow (hotkey →
//! start/stop listening) happens on the tokio side; the widget is a pure
//! observer.
//!
//! # Widget states
//!
//! | State | Visual |
//! |-------|--------|
//! | `Idle` | "Backend stopped" — dim gray |
//! | `Starting…` | "Starting backend…" — yellow dot |
//! | `Ready` | "Press F9 to speak" — blue dot |
//! | `Listening` | live transcription text — green dot |
//! | `Error` | failure message — orange |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eframe::egui;

use crate::backend::{BackendState, SharedBackendState};
use crate::config::AppConfig;

// ---------------------------------------------------------------------------
// SpeakPilotApp
// ---------------------------------------------------------------------------

/// eframe application — the floating voice-input widget.
pub struct SpeakPilotApp {
    /// Backend state + transcription, written by the backend manager.
    shared: SharedBackendState,
    /// Widget visibility flag, toggled from the hotkey control loop.
    visible: Arc<AtomicBool>,
    /// Configured hotkey name shown in the idle hint.
    toggle_key_name: String,
}

impl SpeakPilotApp {
    pub fn new(shared: SharedBackendState, visible: Arc<AtomicBool>, config: &AppConfig) -> Self {
        Self {
            shared,
            visible,
            toggle_key_name: config.hotkey.toggle_listening_key.clone(),
        }
    }
}

impl eframe::App for SpeakPilotApp {
    fn clear_color(&self, _visuals: &egui::Visuals) -> [f32; 4] {
        // Fully transparent window background; the frame below paints its
        // own rounded rect.
        [0.0, 0.0, 0.0, 0.0]
    }

    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // The backend mutates state from tokio tasks, so poll for changes.
        ctx.request_repaint_after(Duration::from_millis(100));

        let (state, transcription) = {
            let shared = self.shared.lock().unwrap();
            (shared.state.clone(), shared.transcription.clone())
        };

        let visible = self.visible.load(Ordering::Relaxed);
        ctx.send_viewport_cmd(egui::ViewportCommand::Visible(visible));
        if !visible {
            return;
        }

        let frame = egui::Frame::default()
            .fill(egui::Color32::from_black_alpha(200))
            .corner_radius(egui::CornerRadius::same(8))
            .inner_margin(egui::Margin::same(10));

        egui::CentralPanel::default().frame(frame).show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.colored_label(state_color(&state), "●");
                ui.label(status_line(&state, &self.toggle_key_name));
            });

            match &state {
                BackendState::Listening => {
                    let text = if transcription.is_empty() {
                        "…".to_owned()
                    } else {
                        transcription
                    };
                    ui.label(egui::RichText::new(text).size(14.0));
                }
                BackendState::Error(failure) => {
                    ui.colored_label(
                        egui::Color32::from_rgb(255, 165, 80),
                        failure.message.clone(),
                    );
                }
                _ => {}
            }
        });
    }
}

// ---------------------------------------------------------------------------
// View helpers
// ---------------------------------------------------------------------------

/// Indicator colour for each backend state.
fn state_color(state: &BackendState) -> egui::Color32 {
    match state {
        BackendState::Idle => egui::Color32::GRAY,
        BackendState::Starting => egui::Color32::YELLOW,
        BackendState::Ready => egui::Color32::from_rgb(100, 160, 255),
        BackendState::Listening => egui::Color32::from_rgb(100, 220, 120),
        BackendState::Error(_) => egui::Color32::from_rgb(255, 165, 80),
    }
}

/// One-line status text next to the indicator dot.
fn status_line(state: &BackendState, toggle_key: &str) -> String {
    match state {
        BackendState::Idle => "Backend stopped".to_owned(),
        BackendState::Starting => "Starting backend…".to_owned(),
        BackendState::Ready => format!("Press {toggle_key} to speak"),
        BackendState::Listening => "Listening".to_owned(),
        BackendState::Error(_) => "Error".to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
