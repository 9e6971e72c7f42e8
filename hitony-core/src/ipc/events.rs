//! Events published on the device event bus.
//!
//! The control worker is the single writer; the LED controller, the display
//! and any debug surface subscribe through
//! [`VoiceEngine::subscribe_events`](crate::engine::VoiceEngine::subscribe_events).
//! No error is ever communicated by silently mutating application state —
//! every user-visible change flows through here.

use serde::{Deserialize, Serialize};

/// The session state as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Connected and waiting for the wake phrase.
    Idle,
    /// Recording an utterance.
    Recording,
    /// Utterance sent; waiting for the server reply.
    Thinking,
    /// Playing a synthesised reply.
    Speaking,
    /// Streaming music.
    Music,
    /// Transport lost; reconnecting.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UiEvent {
    /// Session phase changed.
    Phase { phase: SessionPhase },
    /// Free-form status line ("Connected", "Say 'Hi Tony'", ...).
    Status { text: String },
    /// Recognised text echoed by the server, for the debug surface.
    AsrText { text: String },
    /// Expression overlay requested by the server.
    Expression { expr: String, duration_ms: u64 },
    /// Music title to display, or `None` to hide it.
    MusicTitle { title: Option<String> },
    /// Playback energy in [0.0, 1.0] driving the music animation.
    PlaybackEnergy { energy: f32 },
    /// Seconds until the next reconnect attempt.
    ReconnectCountdown { seconds: u64 },
    /// A newer firmware was announced by the server.
    OtaAvailable { version: String, url: String },
}
