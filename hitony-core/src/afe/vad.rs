//! Energy-based VAD using an RMS threshold + hangover counter.
//!
//! ## Algorithm
//!
//! 1. Compute RMS of the incoming chunk.
//! 2. If RMS ≥ `threshold` → `Speech`, reset the hangover counter.
//! 3. If RMS < `threshold` and the counter > 0 → still `Speech`, decrement
//!    (prevents clipping syllable endings).
//! 4. Otherwise → `Silence`.

/// Per-block speech/silence decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// RMS amplitude threshold on int16 samples.
    threshold: f32,
    /// Below-threshold frames still reported as speech after speech ends.
    hangover_frames: u32,
    hangover_counter: u32,
}

impl EnergyVad {
    pub fn new(threshold: f32, hangover_frames: u32) -> Self {
        Self {
            threshold,
            hangover_frames,
            hangover_counter: 0,
        }
    }

    /// Map the 0–3 sensitivity scale to a threshold/hangover pair.
    /// 0 is lenient (favours quality, long hangover), 3 is aggressive.
    pub fn from_sensitivity(level: u8) -> Self {
        match level {
            0 => Self::new(250.0, 12),
            1 => Self::new(400.0, 8),
            2 => Self::new(600.0, 6),
            _ => Self::new(900.0, 4),
        }
    }

    pub fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum_sq / samples.len() as f64).sqrt() as f32
    }

    pub fn classify(&mut self, samples: &[i16]) -> VadDecision {
        if Self::rms(samples) >= self.threshold {
            self.hangover_counter = self.hangover_frames;
            VadDecision::Speech
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }

    pub fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::from_sensitivity(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_below_threshold() {
        let mut vad = EnergyVad::new(500.0, 0);
        assert_eq!(vad.classify(&[0i16; 160]), VadDecision::Silence);
    }

    #[test]
    fn speech_above_threshold() {
        let mut vad = EnergyVad::new(500.0, 0);
        assert_eq!(vad.classify(&[8000i16; 160]), VadDecision::Speech);
    }

    #[test]
    fn hangover_extends_speech() {
        let mut vad = EnergyVad::new(500.0, 3);
        assert_eq!(vad.classify(&[8000i16; 160]), VadDecision::Speech);
        assert_eq!(vad.classify(&[0i16; 160]), VadDecision::Speech);
        assert_eq!(vad.classify(&[0i16; 160]), VadDecision::Speech);
        assert_eq!(vad.classify(&[0i16; 160]), VadDecision::Speech);
        assert_eq!(vad.classify(&[0i16; 160]), VadDecision::Silence);
    }

    #[test]
    fn reset_clears_hangover() {
        let mut vad = EnergyVad::new(500.0, 5);
        vad.classify(&[8000i16; 160]);
        vad.reset();
        assert_eq!(vad.classify(&[0i16; 160]), VadDecision::Silence);
    }

    #[test]
    fn sensitivity_levels_order_their_thresholds() {
        // Aggressive levels need louder input to classify speech.
        let quiet = [300i16; 160];
        assert!(EnergyVad::from_sensitivity(0)
            .classify(&quiet)
            .is_speech());
        assert!(!EnergyVad::from_sensitivity(3)
            .classify(&quiet)
            .is_speech());
    }
}
