//! Audio front-end: echo cancellation, noise shaping, AGC, VAD and wake
//! detection over interleaved multi-channel chunks.
//!
//! ## Contract with the pipeline worker
//!
//! The front-end runs its own worker thread. [`FrontEnd::feed`] and
//! [`FrontEnd::fetch`] are non-blocking from the caller's perspective; the
//! caller must drain `fetch` every pass so the internal output queue never
//! fills and stalls the worker.
//!
//! Input blocks are interleaved int16, either `(mic0, mic1)` without a
//! reference channel or `(mic0, mic1, ref)` with one, each channel
//! [`AfeConfig::chunk_samples`] long. Output blocks are a single processed
//! channel of the same chunk length plus per-block metadata (VAD decision,
//! optional wake index, volume scalar).
//!
//! A run of all-zero output blocks right after playback starts indicates
//! echo-canceller divergence; the pipeline owns that fallback.

pub mod aec;
pub mod vad;
pub mod wake;

pub use vad::{EnergyVad, VadDecision};
pub use wake::{EnergyBurstWake, WakeDetector};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::error::{HitonyError, Result};
use aec::EchoCanceller;

/// Front-end configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct AfeConfig {
    pub sample_rate: u32,
    /// Microphone channels in the input block.
    pub mic_channels: usize,
    /// Samples per channel per chunk.
    pub chunk_samples: usize,
    /// Reference channel present and echo cancellation available. The
    /// channel layout is fixed by this flag; `enable_aec(false)` at runtime
    /// only bypasses the filter.
    pub enable_aec: bool,
    pub enable_ns: bool,
    pub enable_agc: bool,
    pub enable_vad: bool,
    pub enable_wake: bool,
    /// 0 = lenient/quality, 3 = aggressive.
    pub vad_sensitivity: u8,
    /// AGC compression gain ceiling.
    pub agc_max_gain: f32,
    /// AGC target RMS on int16 samples.
    pub agc_target_rms: f32,
    /// Wake model identifier, reported in logs.
    pub wake_model: String,
}

impl Default for AfeConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::config::SAMPLE_RATE,
            mic_channels: 2,
            chunk_samples: 256,
            enable_aec: true,
            enable_ns: true,
            enable_agc: false,
            enable_vad: true,
            enable_wake: true,
            vad_sensitivity: 1,
            agc_max_gain: 8.0,
            agc_target_rms: 4000.0,
            wake_model: "hitony_burst_v1".to_string(),
        }
    }
}

/// One processed chunk plus metadata.
#[derive(Debug, Clone)]
pub struct AfeOutput {
    pub samples: Vec<i16>,
    pub vad: VadDecision,
    /// Matched wake word index, when the spotter fired on this chunk.
    pub wake: Option<usize>,
    /// Chunk volume in [0.0, 1.0].
    pub volume: f32,
}

const INPUT_QUEUE: usize = 8;
const OUTPUT_QUEUE: usize = 64;

/// Handle to the front-end worker. Owned by the pipeline worker; the control
/// worker never touches it.
pub struct FrontEnd {
    input_tx: Sender<Vec<i16>>,
    output_rx: Receiver<AfeOutput>,
    aec_enabled: Arc<AtomicBool>,
    wake_enabled: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    feed_drops: AtomicU64,
    chunk_samples: usize,
    input_channels: usize,
    worker: Option<JoinHandle<()>>,
}

impl FrontEnd {
    pub fn new(config: AfeConfig, wake: Box<dyn WakeDetector>) -> Result<Self> {
        if config.mic_channels == 0 || config.chunk_samples == 0 {
            return Err(HitonyError::FrontEnd(
                "mic_channels and chunk_samples must be nonzero".into(),
            ));
        }
        let input_channels = config.mic_channels + usize::from(config.enable_aec);
        let chunk_samples = config.chunk_samples;
        let (input_tx, input_rx) = bounded::<Vec<i16>>(INPUT_QUEUE);
        let (output_tx, output_rx) = bounded::<AfeOutput>(OUTPUT_QUEUE);

        let aec_enabled = Arc::new(AtomicBool::new(false));
        let wake_enabled = Arc::new(AtomicBool::new(config.enable_wake));
        let running = Arc::new(AtomicBool::new(true));

        info!(
            channels = input_channels,
            chunk = config.chunk_samples,
            aec = config.enable_aec,
            ns = config.enable_ns,
            agc = config.enable_agc,
            vad = config.enable_vad,
            wake_model = %config.wake_model,
            "front-end starting"
        );

        let worker = thread::Builder::new()
            .name("afe-worker".into())
            .spawn({
                let aec_enabled = Arc::clone(&aec_enabled);
                let wake_enabled = Arc::clone(&wake_enabled);
                let running = Arc::clone(&running);
                move || {
                    worker_loop(
                        config,
                        input_rx,
                        output_tx,
                        aec_enabled,
                        wake_enabled,
                        running,
                        wake,
                    )
                }
            })
            .map_err(|e| HitonyError::FrontEnd(format!("worker spawn: {e}")))?;

        Ok(Self {
            input_tx,
            output_rx,
            aec_enabled,
            wake_enabled,
            running,
            feed_drops: AtomicU64::new(0),
            chunk_samples,
            input_channels,
            worker: Some(worker),
        })
    }

    /// Samples per channel in one chunk.
    pub fn chunk_samples(&self) -> usize {
        self.chunk_samples
    }

    /// Interleaved channels expected in one input block.
    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// Hand one interleaved block to the worker. Non-blocking; returns
    /// `false` when the internal queue is full and the block was dropped.
    pub fn feed(&self, block: &[i16]) -> bool {
        match self.input_tx.try_send(block.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.feed_drops.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Take zero or one processed output block. Non-blocking.
    pub fn fetch(&self) -> Option<AfeOutput> {
        self.output_rx.try_recv().ok()
    }

    /// Toggle echo cancellation at run time.
    pub fn enable_aec(&self, on: bool) {
        self.aec_enabled.store(on, Ordering::Release);
    }

    /// Toggle wake detection at run time.
    pub fn enable_wake(&self, on: bool) {
        self.wake_enabled.store(on, Ordering::Release);
    }

    pub fn feed_drops(&self) -> u64 {
        self.feed_drops.load(Ordering::Relaxed)
    }
}

impl Drop for FrontEnd {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    config: AfeConfig,
    input_rx: Receiver<Vec<i16>>,
    output_tx: Sender<AfeOutput>,
    aec_enabled: Arc<AtomicBool>,
    wake_enabled: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    mut wake: Box<dyn WakeDetector>,
) {
    let chunk = config.chunk_samples;
    let channels = config.mic_channels + usize::from(config.enable_aec);
    let mut vad = EnergyVad::from_sensitivity(config.vad_sensitivity);
    let mut canceller = EchoCanceller::default();
    let mut aec_was_on = false;
    let mut hp_state = 0f32;

    let mut mic0 = vec![0i16; chunk];
    let mut reference = vec![0i16; chunk];
    let mut processed = vec![0i16; chunk];
    let mut output_drops = 0u64;

    while running.load(Ordering::Acquire) {
        let block = match input_rx.recv_timeout(Duration::from_millis(20)) {
            Ok(block) => block,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };
        if block.len() != chunk * channels {
            warn!(
                got = block.len(),
                expected = chunk * channels,
                "front-end block has wrong length, skipping"
            );
            continue;
        }

        // De-interleave the channels we use: mic0 and the trailing reference.
        for i in 0..chunk {
            mic0[i] = block[i * channels];
        }
        if config.enable_aec {
            for i in 0..chunk {
                reference[i] = block[i * channels + (channels - 1)];
            }
        }

        let aec_on = config.enable_aec && aec_enabled.load(Ordering::Acquire);
        if aec_on && !aec_was_on {
            // Fresh convergence for every playback session.
            canceller.reset();
        }
        aec_was_on = aec_on;

        if aec_on {
            canceller.process(&mic0, &reference, &mut processed);
        } else {
            processed.copy_from_slice(&mic0);
        }

        if config.enable_ns {
            // DC-blocking one-pole high-pass takes out rumble and offset.
            for sample in processed.iter_mut() {
                let x = *sample as f32;
                hp_state = 0.995 * hp_state + 0.005 * x;
                *sample = (x - hp_state).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }
        }

        let mut rms = EnergyVad::rms(&processed);
        if config.enable_agc && rms > 1.0 && rms < config.agc_target_rms {
            let gain = (config.agc_target_rms / rms).min(config.agc_max_gain);
            for sample in processed.iter_mut() {
                *sample = ((*sample as f32) * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }
            rms = EnergyVad::rms(&processed);
        }

        let decision = if config.enable_vad {
            vad.classify(&processed)
        } else {
            VadDecision::Speech
        };

        let wake_hit = if wake_enabled.load(Ordering::Acquire) {
            wake.process(&processed)
        } else {
            None
        };
        if let Some(index) = wake_hit {
            info!(index, model = %config.wake_model, "wake word detected");
        }

        let output = AfeOutput {
            samples: processed.clone(),
            vad: decision,
            wake: wake_hit,
            volume: (rms / 32768.0).min(1.0),
        };
        if output_tx.try_send(output).is_err() {
            output_drops += 1;
            if output_drops % 100 == 1 {
                warn!(output_drops, "front-end output queue full");
            }
        }
    }
    debug!(output_drops, "front-end worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct ScriptedWake {
        fire_on_call: usize,
        calls: usize,
    }

    impl WakeDetector for ScriptedWake {
        fn process(&mut self, _frame: &[i16]) -> Option<usize> {
            self.calls += 1;
            (self.calls == self.fire_on_call).then_some(0)
        }

        fn reset(&mut self) {}
    }

    fn test_config() -> AfeConfig {
        AfeConfig {
            mic_channels: 2,
            chunk_samples: 64,
            enable_aec: false,
            enable_ns: false,
            enable_agc: false,
            ..AfeConfig::default()
        }
    }

    fn fetch_with_timeout(afe: &FrontEnd, timeout: Duration) -> AfeOutput {
        let start = Instant::now();
        loop {
            if let Some(out) = afe.fetch() {
                return out;
            }
            if start.elapsed() >= timeout {
                panic!("timed out waiting for front-end output");
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn interleaved(mic0: i16, mic1: i16, chunk: usize) -> Vec<i16> {
        (0..chunk * 2)
            .map(|i| if i % 2 == 0 { mic0 } else { mic1 })
            .collect()
    }

    #[test]
    fn feed_produces_one_output_per_chunk() {
        let afe = FrontEnd::new(
            test_config(),
            Box::new(ScriptedWake {
                fire_on_call: usize::MAX,
                calls: 0,
            }),
        )
        .expect("front-end");
        assert_eq!(afe.input_channels(), 2);
        assert_eq!(afe.chunk_samples(), 64);

        assert!(afe.feed(&interleaved(8000, 1, 64)));
        let out = fetch_with_timeout(&afe, Duration::from_secs(1));
        assert_eq!(out.samples.len(), 64);
        // Output carries mic0, not mic1.
        assert_eq!(out.samples[0], 8000);
        assert_eq!(out.vad, VadDecision::Speech);
        assert!(out.volume > 0.0);
    }

    #[test]
    fn wake_fires_once_at_the_scripted_chunk() {
        let afe = FrontEnd::new(
            test_config(),
            Box::new(ScriptedWake {
                fire_on_call: 2,
                calls: 0,
            }),
        )
        .expect("front-end");

        afe.feed(&interleaved(100, 0, 64));
        let first = fetch_with_timeout(&afe, Duration::from_secs(1));
        assert_eq!(first.wake, None);

        afe.feed(&interleaved(100, 0, 64));
        let second = fetch_with_timeout(&afe, Duration::from_secs(1));
        assert_eq!(second.wake, Some(0));
    }

    #[test]
    fn disabling_wake_mutes_the_detector() {
        let afe = FrontEnd::new(
            test_config(),
            Box::new(ScriptedWake {
                fire_on_call: 1,
                calls: 0,
            }),
        )
        .expect("front-end");
        afe.enable_wake(false);

        afe.feed(&interleaved(100, 0, 64));
        let out = fetch_with_timeout(&afe, Duration::from_secs(1));
        assert_eq!(out.wake, None);
    }

    #[test]
    fn wrong_length_block_is_skipped() {
        let afe = FrontEnd::new(
            test_config(),
            Box::new(ScriptedWake {
                fire_on_call: usize::MAX,
                calls: 0,
            }),
        )
        .expect("front-end");

        afe.feed(&[0i16; 7]);
        afe.feed(&interleaved(1, 1, 64));
        let out = fetch_with_timeout(&afe, Duration::from_secs(1));
        assert_eq!(out.samples.len(), 64);
        // Only one output: the malformed block produced nothing.
        assert!(afe.fetch().is_none());
    }
}
