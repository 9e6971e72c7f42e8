//! Wire protocol: JSON control messages and binary batch framing.
//!
//! ## Control plane (text frames)
//!
//! Every message is a JSON object tagged by `"type"`. Client → server:
//!
//! | Type | Extra fields | When |
//! |------|--------------|------|
//! | `hello` | `device_id`, `fw`, `listen_mode` | first message after connect |
//! | `listen` | `state`, optional `mode`, optional `text` | wake and recording boundaries |
//! | `abort` | optional `reason` | barge-in or local timeout |
//! | `music_ctrl` | `action` | wake during music / post-interaction |
//!
//! Server → client messages are parsed leniently: unknown types map to
//! [`ServerMessage::Unknown`] and unknown fields are ignored, so protocol
//! additions never break the device.
//!
//! ## Data plane (binary frames)
//!
//! Inbound audio arrives batched: `[len_be16][payload]*` with a total bounded
//! by the largest pool class. Outbound audio is one raw compressed payload
//! per frame, no header.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Upper bound on one inbound batch (the largest pool class).
pub const MAX_BATCH_BYTES: usize = 4096;

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Detect,
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    WakeWordDetected,
    SpeakingTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MusicAction {
    Pause,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        device_id: String,
        fw: String,
        listen_mode: ListenMode,
    },
    Listen {
        state: ListenState,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<ListenMode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Abort {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<AbortReason>,
    },
    MusicCtrl {
        action: MusicAction,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        // Serialization of these enums cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub abort: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        features: Option<Features>,
    },
    TtsStart {
        #[serde(default)]
        text: Option<String>,
    },
    TtsEnd {
        #[serde(default)]
        reason: Option<String>,
    },
    MusicStart {
        #[serde(default)]
        title: Option<String>,
    },
    MusicEnd {
        #[serde(default)]
        title: Option<String>,
    },
    MusicResume {
        #[serde(default)]
        title: Option<String>,
    },
    AsrText {
        #[serde(default)]
        text: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    Expression {
        expr: String,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    Pong,
    OtaNotify {
        version: String,
        url: String,
    },
    /// Forward compatibility: any unrecognised `"type"`.
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn parse(data: &[u8]) -> Option<ServerMessage> {
        match serde_json::from_slice(data) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(error = %e, "unparseable server JSON");
                None
            }
        }
    }
}

/// Default expression overlay duration when the server omits `duration_ms`.
pub const DEFAULT_EXPRESSION_MS: u64 = 3000;

// ---------------------------------------------------------------------------
// Binary batch framing
// ---------------------------------------------------------------------------

/// Iterator over the packets of one inbound batch.
///
/// A zero length or a length running past the frame end discards the rest of
/// the batch with a warning; packets already yielded stay valid.
pub struct BatchIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.offset + 2 > self.data.len() {
            return None;
        }
        let len = u16::from_be_bytes([self.data[self.offset], self.data[self.offset + 1]]) as usize;
        let start = self.offset + 2;
        if len == 0 || start + len > self.data.len() {
            warn!(
                pkt_len = len,
                offset = self.offset,
                total = self.data.len(),
                "invalid batch entry, discarding remainder"
            );
            self.offset = self.data.len();
            return None;
        }
        self.offset = start + len;
        Some(&self.data[start..start + len])
    }
}

/// Parse one `[len_be16][payload]*` batch.
pub fn parse_batch(data: &[u8]) -> BatchIter<'_> {
    BatchIter { data, offset: 0 }
}

/// Assemble packets into one batch frame. Used by tests and simulators.
pub fn encode_batch<'a>(packets: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for packet in packets {
        debug_assert!(!packet.is_empty() && packet.len() <= u16::MAX as usize);
        out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        out.extend_from_slice(packet);
    }
    out
}
