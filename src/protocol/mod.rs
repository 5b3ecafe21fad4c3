//! JSON-lines wire protocol spoken with the STT backend process.
//!
//! Commands travel host → backend over the child's stdin; events travel
//! backend → host over its stdout.  Both directions carry exactly one JSON
//! object per line, discriminated by a `type` field:
//!
//! | Direction | `type`           | Extra fields                  |
//! |-----------|------------------|-------------------------------|
//! | → backend | `start`          | —                             |
//! | → backend | `stop`           | —                             |
//! | → backend | `shutdown`       | —                             |
//! | backend → | `ready`          | —                             |
//! | backend → | `speech_started` | —                             |
//! | backend → | `transcription`  | `text: string`, `is_final: bool` |
//! | backend → | `speech_ended`   | —                             |
//! | backend → | `error`          | `message: string`             |
//!
//! Decoding is total and side-effect-free.  Unknown *fields* on a known event
//! are ignored (forward compatibility); an unknown or missing `type` is a
//! [`ProtocolError`] naming the offender.  Protocol errors never tear down
//! the channel — the process runner logs and drops the offending line.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ProtocolError
// ---------------------------------------------------------------------------

/// Errors produced while encoding a command or decoding an event line.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line was not a JSON object matching the event schema.
    #[error("invalid event line: {0}")]
    Decode(#[source] serde_json::Error),

    /// A command failed to serialize (should not happen for these types).
    #[error("cannot encode command: {0}")]
    Encode(#[source] serde_json::Error),
}

// ---------------------------------------------------------------------------
// BackendCommand  (host → backend)
// ---------------------------------------------------------------------------

/// A control command sent to the backend over stdin.
///
/// Encodes as a JSON object carrying only the `type` discriminator,
/// e.g. `{"type":"start"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendCommand {
    /// Begin listening for speech.
    Start,
    /// Stop listening; discard any in-flight utterance.
    Stop,
    /// Ask the backend to exit on its own.
    Shutdown,
}

impl BackendCommand {
    /// Encode this command as one newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(self).map_err(ProtocolError::Encode)?;
        line.push('\n');
        Ok(line)
    }
}

// ---------------------------------------------------------------------------
// BackendEvent  (backend → host)
// ---------------------------------------------------------------------------

/// An event received from the backend over stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    /// The backend finished initialisation and accepts `start`/`stop`.
    Ready,
    /// Voice activity detected.
    SpeechStarted,
    /// A transcription hypothesis — partial while `is_final` is `false`.
    Transcription { text: String, is_final: bool },
    /// Voice activity ended.
    SpeechEnded,
    /// A backend-reported failure.  Non-fatal to the channel itself.
    Error { message: String },
}

impl BackendEvent {
    /// Decode one event from the bytes of a single line (no trailing newline
    /// required).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] for malformed JSON, an unknown or
    /// missing `type`, missing required fields, or invalid UTF-8.  Extra
    /// fields on a known event type are ignored.
    pub fn parse(line: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(line).map_err(ProtocolError::Decode)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ---- BackendCommand encoding ---

    #[test]
    fn encode_start() {
        assert_eq!(
            BackendCommand::Start.to_line().unwrap(),
            "{\"type\":\"start\"}\n"
        );
    }

    #[test]
    fn encode_stop() {
        assert_eq!(
            BackendCommand::Stop.to_line().unwrap(),
            "{\"type\":\"stop\"}\n"
        );
    }

    #[test]
    fn encode_shutdown() {
        assert_eq!(
            BackendCommand::Shutdown.to_line().unwrap(),
            "{\"type\":\"shutdown\"}\n"
        );
    }

    // ---- BackendEvent decoding ---

    #[test]
    fn decode_ready() {
        let event = BackendEvent::parse(br#"{"type":"ready"}"#).unwrap();
        assert_eq!(event, BackendEvent::Ready);
    }

    #[test]
    fn decode_speech_started() {
        let event = BackendEvent::parse(br#"{"type":"speech_started"}"#).unwrap();
        assert_eq!(event, BackendEvent::SpeechStarted);
    }

    #[test]
    fn decode_transcription_final() {
        let event =
            BackendEvent::parse(br#"{"type":"transcription","text":"hello","is_final":true}"#)
                .unwrap();
        assert_eq!(
            event,
            BackendEvent::Transcription {
                text: "hello".into(),
                is_final: true,
            }
        );
    }

    #[test]
    fn decode_transcription_partial() {
        let event =
            BackendEvent::parse(br#"{"type":"transcription","text":"hel","is_final":false}"#)
                .unwrap();
        assert_eq!(
            event,
            BackendEvent::Transcription {
                text: "hel".into(),
                is_final: false,
            }
        );
    }

    #[test]
    fn decode_transcription_preserves_non_ascii() {
        let event =
            BackendEvent::parse("{\"type\":\"transcription\",\"text\":\"こんにちは\",\"is_final\":true}".as_bytes())
                .unwrap();
        assert_eq!(
            event,
            BackendEvent::Transcription {
                text: "こんにちは".into(),
                is_final: true,
            }
        );
    }

    #[test]
    fn decode_speech_ended() {
        let event = BackendEvent::parse(br#"{"type":"speech_ended"}"#).unwrap();
        assert_eq!(event, BackendEvent::SpeechEnded);
    }

    #[test]
    fn decode_error() {
        let event = BackendEvent::parse(br#"{"type":"error","message":"mic not found"}"#).unwrap();
        assert_eq!(
            event,
            BackendEvent::Error {
                message: "mic not found".into(),
            }
        );
    }

    #[test]
    fn decode_unknown_type_fails_naming_it() {
        let err = BackendEvent::parse(br#"{"type":"telemetry"}"#).unwrap_err();
        assert!(err.to_string().contains("telemetry"), "got: {err}");
    }

    #[test]
    fn decode_missing_type_fails() {
        assert!(BackendEvent::parse(br#"{"text":"hello"}"#).is_err());
    }

    #[test]
    fn decode_transcription_missing_text_fails() {
        assert!(BackendEvent::parse(br#"{"type":"transcription","is_final":true}"#).is_err());
    }

    #[test]
    fn decode_transcription_missing_is_final_fails() {
        assert!(BackendEvent::parse(br#"{"type":"transcription","text":"x"}"#).is_err());
    }

    #[test]
    fn decode_error_missing_message_fails() {
        assert!(BackendEvent::parse(br#"{"type":"error"}"#).is_err());
    }

    #[test]
    fn decode_ignores_extra_fields() {
        let event = BackendEvent::parse(
            br#"{"type":"transcription","text":"hi","is_final":false,"confidence":0.93}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            BackendEvent::Transcription {
                text: "hi".into(),
                is_final: false,
            }
        );
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(BackendEvent::parse(b"not json at all").is_err());
        assert!(BackendEvent::parse(b"").is_err());
        assert!(BackendEvent::parse(&[0xff, 0xfe, 0x00]).is_err());
    }

    /// Command lines never accidentally decode as events — the two schemas
    /// share the `type` discriminator but no `type` values.
    #[test]
    fn encoded_commands_are_not_events() {
        for command in [
            BackendCommand::Start,
            BackendCommand::Stop,
            BackendCommand::Shutdown,
        ] {
            let line = command.to_line().unwrap();
            assert!(BackendEvent::parse(line.trim_end().as_bytes()).is_err());
        }
    }
}
