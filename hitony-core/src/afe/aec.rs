//! Acoustic echo cancellation: NLMS adaptive filter.
//!
//! Estimates the speaker→mic echo path from the playback reference and
//! subtracts the estimate from the mic pickup. Divergence shows up as the
//! canceller driving its output to silence; that failure mode is observable
//! by the caller (all-zero output blocks) and handled by the pipeline's
//! fallback, not here.

/// Echo canceller over one mic channel with a mono reference.
pub struct EchoCanceller {
    /// Filter taps estimating the echo path impulse response.
    weights: Vec<f32>,
    /// Reference history, newest first.
    history: Vec<f32>,
    /// NLMS step size in (0, 1].
    step: f32,
}

impl EchoCanceller {
    /// `taps` bounds the modelled echo tail: 256 taps at 16 kHz ≈ 16 ms.
    pub fn new(taps: usize, step: f32) -> Self {
        Self {
            weights: vec![0.0; taps],
            history: vec![0.0; taps],
            step,
        }
    }

    /// Cancel the reference out of `mic`, writing the residual to `out`.
    /// `mic`, `reference` and `out` must have equal lengths.
    pub fn process(&mut self, mic: &[i16], reference: &[i16], out: &mut [i16]) {
        debug_assert_eq!(mic.len(), reference.len());
        debug_assert_eq!(mic.len(), out.len());

        for i in 0..mic.len() {
            // Shift the newest reference sample into the history.
            self.history.rotate_right(1);
            self.history[0] = reference[i] as f32;

            let estimate: f32 = self
                .weights
                .iter()
                .zip(&self.history)
                .map(|(w, x)| w * x)
                .sum();
            let error = mic[i] as f32 - estimate;

            // Normalised update; the epsilon keeps silence from exploding it.
            let energy: f32 = self.history.iter().map(|x| x * x).sum::<f32>() + 1e-3;
            let scale = self.step * error / energy;
            for (w, x) in self.weights.iter_mut().zip(&self.history) {
                *w += scale * x;
            }

            out[i] = error.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
    }

    /// Drop the learned echo path and history.
    pub fn reset(&mut self) {
        self.weights.fill(0.0);
        self.history.fill(0.0);
    }
}

impl Default for EchoCanceller {
    fn default() -> Self {
        Self::new(256, 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn energy(samples: &[i16]) -> f64 {
        samples.iter().map(|&s| (s as f64) * (s as f64)).sum()
    }

    #[test]
    fn zero_reference_passes_the_mic_through() {
        let mut aec = EchoCanceller::new(32, 0.5);
        let mic: Vec<i16> = (0..256).map(|i| ((i % 64) * 100 - 3000) as i16).collect();
        let reference = vec![0i16; 256];
        let mut out = vec![0i16; 256];
        aec.process(&mic, &reference, &mut out);
        assert_eq!(out, mic);
    }

    #[test]
    fn converges_on_a_scaled_echo() {
        let mut aec = EchoCanceller::new(16, 0.7);
        // Mic hears the reference attenuated by half, no near-end speech.
        let mut last_block_energy = 0.0;
        for block in 0..40 {
            let reference: Vec<i16> = (0..256)
                .map(|i| (((block * 256 + i) as f32 * 0.31).sin() * 12_000.0) as i16)
                .collect();
            let mic: Vec<i16> = reference.iter().map(|&r| r / 2).collect();
            let mut out = vec![0i16; 256];
            aec.process(&mic, &reference, &mut out);
            last_block_energy = energy(&out);
        }
        // The residual on the final block should be far below the echo.
        let echo_energy = 256.0 * (6_000.0f64).powi(2);
        assert!(
            last_block_energy < echo_energy / 100.0,
            "residual energy {last_block_energy} vs echo {echo_energy}"
        );
    }

    #[test]
    fn reset_forgets_the_echo_path() {
        let mut aec = EchoCanceller::new(16, 0.7);
        let reference: Vec<i16> = (0..256).map(|i| ((i as f32 * 0.3).sin() * 10_000.0) as i16).collect();
        let mic: Vec<i16> = reference.iter().map(|&r| r / 2).collect();
        let mut out = vec![0i16; 256];
        for _ in 0..20 {
            aec.process(&mic, &reference, &mut out);
        }
        aec.reset();
        // First samples after reset see no estimate at all.
        let silent_ref = vec![0i16; 256];
        aec.process(&mic, &silent_ref, &mut out);
        assert_eq!(out, mic);
    }
}
