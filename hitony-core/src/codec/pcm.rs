//! PCM16 LE pass-through codec.
//!
//! Stands in for the compressing backend in builds without libopus and in
//! the test suite, where byte-transparent packets make ordering and loss
//! directly observable. One "packet" is one frame of little-endian samples.

use super::{AudioDecoder, AudioEncoder};
use crate::error::{HitonyError, Result};

#[derive(Debug, Clone)]
pub struct PcmCodec {
    frame_size: usize,
}

impl PcmCodec {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size }
    }
}

impl AudioEncoder for PcmCodec {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let bytes = pcm.len() * 2;
        if out.len() < bytes {
            return Err(HitonyError::Codec(format!(
                "output buffer too small: {} < {bytes}",
                out.len()
            )));
        }
        for (i, sample) in pcm.iter().enumerate() {
            out[i * 2..i * 2 + 2].copy_from_slice(&sample.to_le_bytes());
        }
        Ok(bytes)
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn reset(&mut self) {}
}

impl AudioDecoder for PcmCodec {
    fn decode(&mut self, packet: &[u8], out: &mut [i16]) -> Result<usize> {
        if packet.len() % 2 != 0 {
            return Err(HitonyError::Codec(format!(
                "odd packet length: {}",
                packet.len()
            )));
        }
        let samples = packet.len() / 2;
        if out.len() < samples {
            return Err(HitonyError::Codec(format!(
                "output buffer too small: {} < {samples}",
                out.len()
            )));
        }
        for (i, chunk) in packet.chunks_exact(2).enumerate() {
            out[i] = i16::from_le_bytes([chunk[0], chunk[1]]);
        }
        Ok(samples)
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn reset(&mut self) {}
}
