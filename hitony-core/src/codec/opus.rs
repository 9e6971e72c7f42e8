//! Opus codec backend (feature `opus`).
//!
//! 16 kHz mono, voip application, 48 kbps — close to the practical optimum
//! for this rate and channel count. Uplink packets are 20 ms, downlink
//! packets 60 ms.

use super::{AudioDecoder, AudioEncoder};
use crate::config::{DECODER_FRAME_SAMPLES, ENCODER_FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::{HitonyError, Result};

/// Uplink encoder bitrate.
pub const UPLINK_BITRATE: i32 = 48_000;

pub struct OpusEncoder {
    inner: opus::Encoder,
    frame_size: usize,
}

impl OpusEncoder {
    pub fn new() -> Result<Self> {
        let mut inner =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
                .map_err(|e| HitonyError::Codec(format!("opus encoder init: {e}")))?;
        inner
            .set_bitrate(opus::Bitrate::Bits(UPLINK_BITRATE))
            .map_err(|e| HitonyError::Codec(format!("opus set_bitrate: {e}")))?;
        Ok(Self {
            inner,
            frame_size: ENCODER_FRAME_SAMPLES,
        })
    }
}

impl AudioEncoder for OpusEncoder {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        self.inner
            .encode(pcm, out)
            .map_err(|e| HitonyError::Codec(format!("opus encode: {e}")))
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn reset(&mut self) {
        if let Err(e) = self.inner.reset_state() {
            tracing::warn!(error = %e, "opus encoder reset failed");
        }
    }
}

pub struct OpusDecoder {
    inner: opus::Decoder,
    frame_size: usize,
}

impl OpusDecoder {
    pub fn new() -> Result<Self> {
        let inner = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| HitonyError::Codec(format!("opus decoder init: {e}")))?;
        Ok(Self {
            inner,
            frame_size: DECODER_FRAME_SAMPLES,
        })
    }
}

impl AudioDecoder for OpusDecoder {
    fn decode(&mut self, packet: &[u8], out: &mut [i16]) -> Result<usize> {
        self.inner
            .decode(packet, out, false)
            .map_err(|e| HitonyError::Codec(format!("opus decode: {e}")))
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn reset(&mut self) {
        if let Err(e) = self.inner.reset_state() {
            tracing::warn!(error = %e, "opus decoder reset failed");
        }
    }
}
