//! # hitony-core
//!
//! Real-time audio and control core of the HiTony voice device.
//!
//! ## Architecture
//!
//! ```text
//! Mics ─► Capture & Pipeline worker ─► front-end (AEC/VAD/wake) ─► encoder
//!              │        ▲                                            │
//!              ▼        │ playback queue                     uplink  ▼
//!          Speaker ◄─ decoder ◄──────────── Control worker ◄──────► server
//!                                             │    ▲
//!                                  UiEvent bus│    │ transport sink
//!                                             ▼    │ (network thread)
//!                                        LED / display
//! ```
//!
//! Two long-running workers on separate threads communicate exclusively
//! through bounded queues, lock-free PCM rings and an atomic event-bit set.
//! Every per-packet allocation on a hot path comes from the fixed block
//! pools. The transport callback copies and enqueues, nothing more.

// The SPSC ring needs two unsafe blocks for its buffer cell; everything
// else in the crate is safe code.
#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod afe;
pub mod buffering;
pub mod codec;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod pipeline;
pub mod protocol;
pub mod transport;

// Convenience re-exports for downstream crates
pub use config::{ControlConfig, PipelineConfig};
pub use engine::{EngineConfig, VoiceEngine};
pub use error::HitonyError;
pub use identity::DeviceIdentity;
pub use ipc::events::{SessionPhase, UiEvent};
