//! Tunable parameters for both workers.
//!
//! Every timeout and size lives here with the production default, so the test
//! suite can shrink timescales instead of sleeping for wall-clock seconds.

use std::time::Duration;

/// Audio numerics shared by both directions.
///
/// 16 kHz mono PCM16 end to end. The uplink codec frame is 20 ms
/// (320 samples), the downlink decoder frame is 60 ms (960 samples).
pub const SAMPLE_RATE: u32 = 16_000;

/// Uplink codec frame: 20 ms at 16 kHz.
pub const ENCODER_FRAME_SAMPLES: usize = 320;

/// Downlink decoder frame: 60 ms at 16 kHz.
pub const DECODER_FRAME_SAMPLES: usize = 960;

/// Configuration for the capture & pipeline worker.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Samples per channel in one capture read (one DMA period, ~16 ms).
    pub capture_frame_samples: usize,
    /// Front-end chunk size per channel.
    pub afe_chunk_samples: usize,
    /// Fixed software preamp applied to the uplink after the front-end.
    pub uplink_gain: i32,
    /// Contiguous silence (wall-clock) that ends a recording.
    pub silence_window: Duration,
    /// Recordings shorter than this at silence-detect time cancel without a
    /// server turn.
    pub short_utterance: Duration,
    /// Hard recording cap enforced by the pipeline worker.
    pub max_recording: Duration,
    /// Thinking sub-mode timeout without a playback command.
    pub thinking_timeout: Duration,
    /// Wake suppression window after playback starts (echo-canceller
    /// convergence).
    pub aec_convergence: Duration,
    /// Consecutive all-zero front-end blocks after playback start before the
    /// echo canceller is disabled as diverged.
    pub aec_zero_block_fallback: u32,
    /// Bounded wait on the playback queue before counting an underrun.
    pub playback_wait: Duration,
    /// Maximum front-end output blocks drained per loop pass.
    pub max_fetch_per_pass: usize,
    /// Forward acoustic wake events while the speaker is playing. Mirrors
    /// [`ControlConfig::acoustic_barge_in`]; the engine copies the policy
    /// switch here so both workers gate consistently.
    pub acoustic_barge_in: bool,
    /// Interval between periodic stats logs.
    pub stats_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture_frame_samples: 256,
            afe_chunk_samples: 256,
            uplink_gain: 3,
            silence_window: Duration::from_millis(800),
            short_utterance: Duration::from_millis(500),
            max_recording: Duration::from_secs(10),
            thinking_timeout: Duration::from_secs(15),
            aec_convergence: Duration::from_millis(300),
            aec_zero_block_fallback: 100,
            playback_wait: Duration::from_millis(20),
            max_fetch_per_pass: 10,
            acoustic_barge_in: false,
            stats_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration for the control worker.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Firmware version reported in the `hello` handshake and compared
    /// against `ota_notify`.
    pub firmware_version: String,
    /// Wake phrase reported in `listen{state=detect}`.
    pub wake_phrase: String,
    /// Main loop tick. Drain-wait counts consecutive empty observations at
    /// this cadence.
    pub tick: Duration,
    /// Consecutive empty-queue observations before leaving Speaking/Music.
    pub drain_observations: u32,
    /// Recording hard cap enforced by the control worker.
    pub recording_cap: Duration,
    /// Thinking timeout waiting for `tts_start`.
    pub thinking_timeout: Duration,
    /// Speaking starvation timeout measured from the last inbound packet.
    pub speaking_timeout: Duration,
    /// Progressive stall warnings before the speaking timeout fires.
    pub stall_warnings: [Duration; 2],
    /// First reconnect backoff delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Stale `music_was_playing` flag cleanup window.
    pub music_flag_timeout: Duration,
    /// Bounded wait for a playback queue slot per inbound packet.
    pub playback_enqueue_wait: Duration,
    /// Maximum receive-queue messages processed per tick.
    pub max_rx_per_tick: usize,
    /// Maximum uplink packets pumped to the transport per tick.
    pub max_tx_per_tick: usize,
    /// Enter Recording automatically after a reply finishes playing.
    /// Off by default: with the speaker still ringing this creates a noise
    /// loop on devices without a convergent echo canceller.
    pub auto_listen: bool,
    /// Honour acoustic wake events during Speaking/Music. Off by default;
    /// touch wake is always honoured regardless.
    pub acoustic_barge_in: bool,
    /// Heartbeat log interval.
    pub heartbeat_interval: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            wake_phrase: "Hi Tony".to_string(),
            tick: Duration::from_millis(10),
            drain_observations: 10,
            recording_cap: Duration::from_secs(15),
            thinking_timeout: Duration::from_secs(10),
            speaking_timeout: Duration::from_secs(8),
            stall_warnings: [Duration::from_secs(2), Duration::from_secs(4)],
            backoff_base: Duration::from_secs(3),
            backoff_max: Duration::from_secs(24),
            music_flag_timeout: Duration::from_secs(10),
            playback_enqueue_wait: Duration::from_millis(30),
            max_rx_per_tick: 10,
            max_tx_per_tick: 4,
            auto_listen: false,
            acoustic_barge_in: false,
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}
