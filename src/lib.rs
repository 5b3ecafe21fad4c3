//! speak-pilot — system-wide voice input for the focused application.
//!
//! A long-lived Python STT backend runs as a child process and streams
//! recognition events over newline-delimited JSON stdio.  This crate hosts
//! it: spawning and supervising the process, driving the
//! idle/starting/ready/listening state machine, pasting final transcriptions
//! into whatever application has focus, and rendering a small always-on-top
//! status widget.
//!
//! # Module map
//!
//! | Module | Role |
//! |--------|------|
//! | [`protocol`] | command/event schema and JSON-lines (de)serialization |
//! | [`backend`]  | process runner + lifecycle state machine |
//! | [`config`]   | `settings.toml` persistence and platform paths |
//! | [`hotkey`]   | global toggle hotkey (rdev listener thread) |
//! | [`inject`]   | clipboard-paste text insertion |
//! | [`app`]      | egui floating status widget |

pub mod app;
pub mod backend;
pub mod config;
pub mod hotkey;
pub mod inject;
pub mod protocol;
