//! Audio codec abstraction.
//!
//! The `AudioEncoder` / `AudioDecoder` traits decouple the pipeline from the
//! compression backend. `&mut self` expresses that codecs are stateful across
//! frames (prediction history, packet-loss concealment); an encode or decode
//! failure drops one frame without losing that state, and `reset` clears it
//! between sessions.
//!
//! The default backend is [`pcm::PcmCodec`] (PCM16 LE pass-through); the
//! `opus` feature adds [`OpusEncoder`]/[`OpusDecoder`] over libopus at the
//! production bitrate.

pub mod pcm;

#[cfg(feature = "opus")]
pub mod opus;

#[cfg(feature = "opus")]
pub use opus::{OpusDecoder, OpusEncoder};

use crate::error::Result;

/// Compresses fixed-duration PCM frames into packets.
pub trait AudioEncoder: Send + 'static {
    /// Encode exactly [`frame_size`](AudioEncoder::frame_size) samples into
    /// `out`, returning the packet length in bytes.
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize>;

    /// PCM samples the encoder consumes per packet.
    fn frame_size(&self) -> usize;

    /// Clear inter-frame state between sessions.
    fn reset(&mut self);
}

/// Decompresses packets into PCM frames.
pub trait AudioDecoder: Send + 'static {
    /// Decode one packet into `out`, returning the sample count produced.
    fn decode(&mut self, packet: &[u8], out: &mut [i16]) -> Result<usize>;

    /// Maximum PCM samples one packet decodes to.
    fn frame_size(&self) -> usize;

    /// Clear inter-frame state between sessions.
    fn reset(&mut self);
}
