//! Pipeline → control event bits with atomic read-clear semantics.
//!
//! The pipeline worker sets bits as things happen; the control worker takes
//! the whole set atomically once per tick. Setting an already-set bit
//! coalesces, which is the desired behaviour for edge events like wake.

use std::sync::atomic::{AtomicU32, Ordering};

/// Acoustic wake word fired in the front-end.
pub const WAKE_DETECTED: u32 = 1 << 0;
/// Recording ended on silence or the pipeline-side cap.
pub const VAD_END: u32 = 1 << 1;
/// An encoded uplink packet was queued.
pub const ENCODE_READY: u32 = 1 << 2;
/// Touch-sourced wake; exempt from the acoustic gating.
pub const TOUCH_WAKE: u32 = 1 << 3;
/// Recording cancelled as a short utterance; no server turn is produced.
pub const SHORT_CANCEL: u32 = 1 << 4;

#[derive(Debug, Default)]
pub struct EventBits(AtomicU32);

impl EventBits {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn set(&self, bits: u32) {
        self.0.fetch_or(bits, Ordering::AcqRel);
    }

    /// Atomically take and clear every pending bit.
    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }

    /// Peek without clearing. Diagnostics only.
    pub fn peek(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears_all_pending_bits() {
        let bits = EventBits::new();
        bits.set(WAKE_DETECTED);
        bits.set(VAD_END | ENCODE_READY);
        assert_eq!(bits.take(), WAKE_DETECTED | VAD_END | ENCODE_READY);
        assert_eq!(bits.take(), 0);
    }

    #[test]
    fn setting_the_same_bit_twice_coalesces() {
        let bits = EventBits::new();
        bits.set(TOUCH_WAKE);
        bits.set(TOUCH_WAKE);
        assert_eq!(bits.take(), TOUCH_WAKE);
    }
}
