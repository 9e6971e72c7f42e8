//! Audio device seam.
//!
//! The codec/I²S bring-up is a collaborator; the pipeline only needs a
//! blocking read of interleaved stereo capture frames and a blocking mono
//! playout. Reads are bounded by one DMA period, writes by the playout
//! duration of the frame — those bounds are what paces the pipeline loop.

use std::time::{Duration, Instant};

use crate::config::SAMPLE_RATE;
use crate::error::Result;

pub trait AudioIo: Send + 'static {
    /// Fill `buf` with interleaved stereo int16 capture samples. Blocks at
    /// most one DMA period; returns the interleaved sample count (an even
    /// number, mic0 at even indices, mic1 at odd).
    fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize>;

    /// Write one mono int16 frame to the speaker. Blocks while the DMA
    /// buffer drains.
    fn play_frame(&mut self, pcm: &[i16]) -> Result<()>;
}

/// Host stand-in device: captures silence at the real-time rate and
/// discards playout while emulating DMA pacing. Lets the full firmware run
/// on a development machine without audio hardware.
pub struct SilenceAudio {
    next_read: Instant,
}

impl SilenceAudio {
    pub fn new() -> Self {
        Self {
            next_read: Instant::now(),
        }
    }
}

impl Default for SilenceAudio {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioIo for SilenceAudio {
    fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize> {
        let mono = buf.len() / 2;
        let period = Duration::from_micros(1_000_000 * mono as u64 / SAMPLE_RATE as u64);
        let now = Instant::now();
        if self.next_read > now {
            std::thread::sleep(self.next_read - now);
        }
        self.next_read = Instant::now() + period;
        buf.fill(0);
        Ok(buf.len())
    }

    fn play_frame(&mut self, pcm: &[i16]) -> Result<()> {
        std::thread::sleep(Duration::from_micros(
            1_000_000 * pcm.len() as u64 / SAMPLE_RATE as u64,
        ));
        Ok(())
    }
}
