//! Capture & pipeline worker.
//!
//! ## One pass per iteration
//!
//! ```text
//! 1. Playback dispatch (Playing only): dequeue → decode → speaker,
//!    mirror PCM into the reference ring. No `continue` — capture and the
//!    front-end keep running during playback so wake stays live.
//! 2. Capture read: one fixed frame from the codec, split into the
//!    mic0/mic1 rings.
//! 3. Command poll (non-blocking) from the control worker.
//! 4. Front-end feed: compose (mic0, mic1[, ref]) into one interleaved
//!    chunk, zero-filling an under-supplied reference.
//! 5. Front-end fetch (bounded drain): endpointing, codec accumulation,
//!    uplink encode, wake gating.
//! 6. Thinking timeout.
//! 7. Periodic stats.
//! ```
//!
//! All failures here are local: a decode error drops one packet, an encoder
//! failure drops one frame, pool exhaustion drops one packet. Nothing blocks
//! the audio path and nothing desynchronises the codec state.

pub mod io;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::afe::{FrontEnd, VadDecision};
use crate::buffering::{MemoryPools, PcmRing};
use crate::codec::{AudioDecoder, AudioEncoder};
use crate::config::PipelineConfig;
use crate::ipc::flags::{self, EventBits};
use crate::ipc::AudioPacket;
use io::AudioIo;

/// Pipeline sub-mode, independent from the session state owned by the
/// control worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    Idle,
    Recording,
    Thinking,
    Playing,
}

impl AudioMode {
    fn name(self) -> &'static str {
        match self {
            AudioMode::Idle => "IDLE",
            AudioMode::Recording => "RECORDING",
            AudioMode::Thinking => "THINKING",
            AudioMode::Playing => "PLAYING",
        }
    }
}

/// Commands from the control worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCommand {
    StartRecording,
    StopRecording,
    StartPlayback,
    StopPlayback,
}

#[derive(Debug, Default)]
pub struct PipelineDiagnostics {
    pub frames_captured: AtomicU64,
    pub samples_captured: AtomicU64,
    pub ring_dropped_samples: AtomicU64,
    pub packets_encoded: AtomicU64,
    pub encode_errors: AtomicU64,
    pub uplink_dropped: AtomicU64,
    pub packets_played: AtomicU64,
    pub playback_underruns: AtomicU64,
    pub decode_errors: AtomicU64,
    pub short_cancels: AtomicU64,
    pub wake_suppressed: AtomicU64,
    pub aec_fallbacks: AtomicU64,
    /// f32 bits of the latest playback energy, for the music animation.
    pub playback_energy_bits: AtomicU32,
}

impl PipelineDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            samples_captured: self.samples_captured.load(Ordering::Relaxed),
            ring_dropped_samples: self.ring_dropped_samples.load(Ordering::Relaxed),
            packets_encoded: self.packets_encoded.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            uplink_dropped: self.uplink_dropped.load(Ordering::Relaxed),
            packets_played: self.packets_played.load(Ordering::Relaxed),
            playback_underruns: self.playback_underruns.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            short_cancels: self.short_cancels.load(Ordering::Relaxed),
            wake_suppressed: self.wake_suppressed.load(Ordering::Relaxed),
            aec_fallbacks: self.aec_fallbacks.load(Ordering::Relaxed),
        }
    }

    pub fn playback_energy(&self) -> f32 {
        f32::from_bits(self.playback_energy_bits.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticsSnapshot {
    pub frames_captured: u64,
    pub samples_captured: u64,
    pub ring_dropped_samples: u64,
    pub packets_encoded: u64,
    pub encode_errors: u64,
    pub uplink_dropped: u64,
    pub packets_played: u64,
    pub playback_underruns: u64,
    pub decode_errors: u64,
    pub short_cancels: u64,
    pub wake_suppressed: u64,
    pub aec_fallbacks: u64,
}

/// Everything the worker needs, passed as one struct so the thread closure
/// stays tidy.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub audio: Box<dyn AudioIo>,
    pub afe: FrontEnd,
    pub encoder: Box<dyn AudioEncoder>,
    pub decoder: Box<dyn AudioDecoder>,
    pub mic0: Arc<PcmRing>,
    pub mic1: Arc<PcmRing>,
    pub reference: Arc<PcmRing>,
    pub pools: Arc<MemoryPools>,
    pub commands: Receiver<AudioCommand>,
    pub playback: Receiver<AudioPacket>,
    pub uplink: Sender<AudioPacket>,
    pub events: Arc<EventBits>,
    pub running: Arc<std::sync::atomic::AtomicBool>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

struct WorkerState {
    mode: AudioMode,
    /// Uplink frame accumulator (codec frame size).
    accumulator: Vec<i16>,
    accum_count: usize,
    recording_start: Option<Instant>,
    silence_start: Option<Instant>,
    thinking_start: Option<Instant>,
    /// Recording already endpointed; suppress duplicate VAD_END.
    vad_end_posted: bool,
    /// Wake suppression window after playback start.
    wake_mute_until: Option<Instant>,
    /// Silence endpointing suppressed until this instant after playback.
    vad_cooldown_until: Option<Instant>,
    aec_available: bool,
    aec_active: bool,
    /// Consecutive all-zero front-end blocks while the canceller runs.
    zero_blocks: u32,
    tts_play_count: u64,
    tts_underrun_count: u64,
}

/// Run the pipeline worker until `ctx.running` goes false.
pub fn run(mut ctx: PipelineContext) {
    let enc_frame = ctx.encoder.frame_size();
    let chunk = ctx.afe.chunk_samples();
    let channels = ctx.afe.input_channels();

    let mut state = WorkerState {
        mode: AudioMode::Idle,
        accumulator: vec![0i16; enc_frame],
        accum_count: 0,
        recording_start: None,
        silence_start: None,
        thinking_start: None,
        vad_end_posted: false,
        wake_mute_until: None,
        vad_cooldown_until: None,
        aec_available: channels == 3,
        aec_active: false,
        zero_blocks: 0,
        tts_play_count: 0,
        tts_underrun_count: 0,
    };

    let mut capture_buf = vec![0i16; ctx.config.capture_frame_samples * 2];
    let mut mic0_buf = vec![0i16; ctx.config.capture_frame_samples];
    let mut mic1_buf = vec![0i16; ctx.config.capture_frame_samples];
    let mut chunk_mic0 = vec![0i16; chunk];
    let mut chunk_mic1 = vec![0i16; chunk];
    let mut chunk_ref = vec![0i16; chunk];
    let mut feed_block = vec![0i16; chunk * channels];
    let mut decode_buf = vec![0i16; ctx.decoder.frame_size()];
    let mut encode_buf = vec![0u8; 1500];
    let mut capture_rms = 0f32;
    let mut last_volume = 0f32;
    let mut last_stats = Instant::now();

    info!(
        enc_frame,
        chunk, channels, "pipeline worker entering main loop"
    );

    while ctx.running.load(Ordering::Acquire) {
        // ── 1. Playback dispatch ─────────────────────────────────────────
        if state.mode == AudioMode::Playing {
            match ctx.playback.recv_timeout(ctx.config.playback_wait) {
                Ok(packet) => {
                    state.tts_play_count += 1;
                    state.tts_underrun_count = 0;
                    match ctx.decoder.decode(packet.payload(), &mut decode_buf) {
                        Ok(samples) if samples > 0 => {
                            let pcm = &decode_buf[..samples];
                            ctx.diagnostics
                                .packets_played
                                .fetch_add(1, Ordering::Relaxed);

                            let energy =
                                crate::afe::EnergyVad::rms(pcm) / f32::from(i16::MAX);
                            ctx.diagnostics
                                .playback_energy_bits
                                .store(energy.to_bits(), Ordering::Relaxed);

                            if let Err(e) = ctx.audio.play_frame(pcm) {
                                warn!(error = %e, "speaker write failed");
                            }
                            // Mirror into the reference ring for the canceller.
                            ctx.reference.write(pcm);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            ctx.diagnostics.decode_errors.fetch_add(1, Ordering::Relaxed);
                            let n = ctx.diagnostics.decode_errors.load(Ordering::Relaxed);
                            if n <= 3 || n % 100 == 0 {
                                warn!(error = %e, dropped = n, "packet decode failed");
                            }
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    state.tts_underrun_count += 1;
                    ctx.diagnostics
                        .playback_underruns
                        .fetch_add(1, Ordering::Relaxed);
                    if state.tts_underrun_count <= 3 || state.tts_underrun_count % 200 == 0 {
                        warn!(
                            underruns = state.tts_underrun_count,
                            played = state.tts_play_count,
                            "playback underrun"
                        );
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
            // Fall through: capture and the front-end still run while
            // playing, so wake-during-playback works.
        }

        // ── 2. Capture read ──────────────────────────────────────────────
        match ctx.audio.read_frame(&mut capture_buf) {
            Ok(n) if n >= 2 => {
                let mono = n / 2;
                ctx.diagnostics
                    .frames_captured
                    .fetch_add(1, Ordering::Relaxed);
                ctx.diagnostics
                    .samples_captured
                    .fetch_add(mono as u64, Ordering::Relaxed);

                for i in 0..mono {
                    mic0_buf[i] = capture_buf[i * 2];
                    mic1_buf[i] = capture_buf[i * 2 + 1];
                }
                // Mic RMS while not playing: during playback this would
                // measure the speaker, not the room.
                if state.mode != AudioMode::Playing {
                    capture_rms = crate::afe::EnergyVad::rms(&mic0_buf[..mono]);
                }

                let written = ctx.mic0.write(&mic0_buf[..mono]);
                ctx.mic1.write(&mic1_buf[..mono]);
                if written < mono {
                    ctx.diagnostics
                        .ring_dropped_samples
                        .fetch_add((mono - written) as u64, Ordering::Relaxed);
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "capture read failed");
            }
        }

        // ── 3. Command poll ──────────────────────────────────────────────
        while let Ok(cmd) = ctx.commands.try_recv() {
            apply_command(cmd, &mut state, &mut ctx);
        }

        // ── 4. Front-end feed ────────────────────────────────────────────
        if ctx.mic0.available() >= chunk && ctx.mic1.available() >= chunk {
            ctx.mic0.read(&mut chunk_mic0);
            ctx.mic1.read(&mut chunk_mic1);
            if channels == 3 {
                let got = ctx.reference.read(&mut chunk_ref);
                // Zero-fill an under-supplied reference.
                chunk_ref[got..].fill(0);
                for i in 0..chunk {
                    feed_block[i * 3] = chunk_mic0[i];
                    feed_block[i * 3 + 1] = chunk_mic1[i];
                    feed_block[i * 3 + 2] = chunk_ref[i];
                }
            } else {
                for i in 0..chunk {
                    feed_block[i * 2] = chunk_mic0[i];
                    feed_block[i * 2 + 1] = chunk_mic1[i];
                }
            }
            ctx.afe.feed(&feed_block);
        }

        // ── 5. Front-end fetch ───────────────────────────────────────────
        for _ in 0..ctx.config.max_fetch_per_pass {
            let Some(output) = ctx.afe.fetch() else { break };
            last_volume = output.volume;
            handle_afe_output(output, &mut state, &mut ctx, &mut encode_buf, enc_frame);
        }

        // ── 6. Thinking timeout ──────────────────────────────────────────
        if state.mode == AudioMode::Thinking {
            if let Some(start) = state.thinking_start {
                if start.elapsed() > ctx.config.thinking_timeout {
                    warn!(
                        timeout_ms = ctx.config.thinking_timeout.as_millis() as u64,
                        "thinking timed out, returning to idle"
                    );
                    state.mode = AudioMode::Idle;
                    state.thinking_start = None;
                }
            }
        }

        // ── 7. Periodic stats ────────────────────────────────────────────
        if last_stats.elapsed() >= ctx.config.stats_interval {
            last_stats = Instant::now();
            let snap = ctx.diagnostics.snapshot();
            info!(
                mode = state.mode.name(),
                frames = snap.frames_captured,
                samples = snap.samples_captured,
                mic0_depth = ctx.mic0.available(),
                mic1_depth = ctx.mic1.available(),
                ref_depth = ctx.reference.available(),
                encoded = snap.packets_encoded,
                played = snap.packets_played,
                underruns = snap.playback_underruns,
                ring_drops = snap.ring_dropped_samples,
                afe_volume = last_volume,
                capture_rms,
                "pipeline stats"
            );
            ctx.pools.log_stats();
        }
    }

    info!("pipeline worker exiting");
}

fn apply_command(cmd: AudioCommand, state: &mut WorkerState, ctx: &mut PipelineContext) {
    debug!(?cmd, mode = state.mode.name(), "audio command");
    match cmd {
        AudioCommand::StartRecording => {
            state.mode = AudioMode::Recording;
            state.recording_start = Some(Instant::now());
            state.silence_start = None;
            state.thinking_start = None;
            state.vad_end_posted = false;
            state.accum_count = 0;
            // Stale audio (including speaker echo) must not leak into the
            // new utterance.
            ctx.mic0.reset();
            ctx.mic1.reset();
            ctx.reference.reset();
            if state.aec_available {
                ctx.afe.enable_aec(false);
                state.aec_active = false;
            }
            ctx.encoder.reset();
            ctx.decoder.reset();
        }
        AudioCommand::StopRecording => {
            if state.mode == AudioMode::Recording {
                enter_thinking(state, ctx, "commanded stop");
            }
            state.accum_count = 0;
        }
        AudioCommand::StartPlayback => {
            state.mode = AudioMode::Playing;
            state.thinking_start = None;
            state.tts_play_count = 0;
            state.tts_underrun_count = 0;
            state.zero_blocks = 0;
            if state.aec_available {
                ctx.afe.enable_aec(true);
                state.aec_active = true;
                // Wake stays muted until the canceller has had a chance to
                // converge on the new echo path.
                state.wake_mute_until = Some(Instant::now() + ctx.config.aec_convergence);
            }
        }
        AudioCommand::StopPlayback => {
            state.mode = AudioMode::Idle;
            state.accum_count = 0;
            // Stale echo in the reference/mic1 rings would poison the next
            // front-end chunks.
            ctx.reference.reset();
            ctx.mic1.reset();
            if state.aec_available {
                ctx.afe.enable_aec(false);
                state.aec_active = false;
            }
            ctx.decoder.reset();
            state.vad_cooldown_until = Some(Instant::now() + ctx.config.silence_window);
        }
    }
}

fn enter_thinking(state: &mut WorkerState, ctx: &mut PipelineContext, reason: &str) {
    info!(reason, "recording ended, entering thinking");
    state.mode = AudioMode::Thinking;
    state.thinking_start = Some(Instant::now());
    state.recording_start = None;
    state.silence_start = None;
    state.accum_count = 0;
    if !state.vad_end_posted {
        state.vad_end_posted = true;
        ctx.events.set(flags::VAD_END);
    }
}

fn handle_afe_output(
    output: crate::afe::AfeOutput,
    state: &mut WorkerState,
    ctx: &mut PipelineContext,
    encode_buf: &mut [u8],
    enc_frame: usize,
) {
    let now = Instant::now();

    // ── AEC divergence fallback ─────────────────────────────────────────
    if state.mode == AudioMode::Playing && state.aec_active {
        if output.samples.iter().all(|&s| s == 0) {
            state.zero_blocks += 1;
            if state.zero_blocks >= ctx.config.aec_zero_block_fallback {
                warn!(
                    zero_blocks = state.zero_blocks,
                    "echo canceller diverged, disabling as degraded fallback"
                );
                ctx.afe.enable_aec(false);
                state.aec_active = false;
                state.zero_blocks = 0;
                ctx.diagnostics.aec_fallbacks.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            state.zero_blocks = 0;
        }
    }

    // ── Recording cap ───────────────────────────────────────────────────
    if state.mode == AudioMode::Recording {
        if let Some(start) = state.recording_start {
            if start.elapsed() > ctx.config.max_recording {
                enter_thinking(state, ctx, "max recording time");
                return;
            }
        }
    }

    // ── VAD endpointing (Recording only) ────────────────────────────────
    if state.mode == AudioMode::Recording {
        let in_cooldown = state
            .vad_cooldown_until
            .is_some_and(|until| now < until);
        if output.vad == VadDecision::Silence && !in_cooldown {
            let silence_since = *state.silence_start.get_or_insert(now);
            // Wall-clock, not block count: a paused front-end must not
            // stretch the window.
            if now.duration_since(silence_since) > ctx.config.silence_window {
                // Speech length is what came before the silence began.
                let recorded = state
                    .recording_start
                    .map(|s| silence_since.duration_since(s))
                    .unwrap_or_default();
                if recorded < ctx.config.short_utterance {
                    // Auto-listen with no speech: skip the server turn.
                    info!(
                        recorded_ms = recorded.as_millis() as u64,
                        "short recording cancelled without a server turn"
                    );
                    state.mode = AudioMode::Idle;
                    state.recording_start = None;
                    state.silence_start = None;
                    state.accum_count = 0;
                    state.vad_cooldown_until = Some(now + ctx.config.silence_window);
                    ctx.diagnostics.short_cancels.fetch_add(1, Ordering::Relaxed);
                    ctx.events.set(flags::SHORT_CANCEL);
                } else {
                    enter_thinking(state, ctx, "silence window elapsed");
                }
                return;
            }
        } else if output.vad == VadDecision::Speech {
            state.silence_start = None;
        }
    }

    // ── Codec accumulation (Recording only) ─────────────────────────────
    if state.mode == AudioMode::Recording {
        let mut offset = 0;
        while offset < output.samples.len() {
            let take = (enc_frame - state.accum_count).min(output.samples.len() - offset);
            state.accumulator[state.accum_count..state.accum_count + take]
                .copy_from_slice(&output.samples[offset..offset + take]);
            state.accum_count += take;
            offset += take;

            if state.accum_count >= enc_frame {
                state.accum_count = 0;
                encode_frame(state, ctx, encode_buf);
            }
        }
    }

    // ── Wake gating ─────────────────────────────────────────────────────
    if output.wake.is_some() {
        if state.wake_mute_until.is_some_and(|until| now < until) {
            ctx.diagnostics.wake_suppressed.fetch_add(1, Ordering::Relaxed);
            warn!("wake suppressed during echo-canceller convergence");
        } else if state.mode == AudioMode::Playing && !ctx.config.acoustic_barge_in {
            // Speaker echo self-triggers the spotter; acoustic wake is
            // muted for the whole playback unless the barge-in policy is
            // enabled. Touch wake bypasses this path entirely.
            ctx.diagnostics.wake_suppressed.fetch_add(1, Ordering::Relaxed);
        } else {
            ctx.events.set(flags::WAKE_DETECTED);
        }
    }
}

fn encode_frame(state: &mut WorkerState, ctx: &mut PipelineContext, encode_buf: &mut [u8]) {
    // Fixed 3× software gain with saturation: keeps the speech/silence ratio
    // intact, unlike adaptive gain which amplifies noise-only frames.
    let gain = ctx.config.uplink_gain;
    for sample in state.accumulator.iter_mut() {
        let amplified = i32::from(*sample) * gain;
        *sample = amplified.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
    }

    match ctx.encoder.encode(&state.accumulator, encode_buf) {
        Ok(len) if len > 0 => {
            let Some(block) = ctx.pools.acquire_copy(&encode_buf[..len]) else {
                ctx.diagnostics.uplink_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(len, "uplink pool exhausted, packet dropped");
                return;
            };
            match ctx.uplink.try_send(AudioPacket { block }) {
                Ok(()) => {
                    ctx.diagnostics.packets_encoded.fetch_add(1, Ordering::Relaxed);
                    let count = ctx.diagnostics.packets_encoded.load(Ordering::Relaxed);
                    if count <= 3 || count % 50 == 0 {
                        debug!(count, len, "uplink packet encoded");
                    }
                    ctx.events.set(flags::ENCODE_READY);
                }
                Err(_) => {
                    // Backpressure: never block the audio path.
                    ctx.diagnostics.uplink_dropped.fetch_add(1, Ordering::Relaxed);
                    let drops = ctx.diagnostics.uplink_dropped.load(Ordering::Relaxed);
                    if drops <= 3 || drops % 50 == 0 {
                        warn!(drops, "uplink queue full, packet dropped");
                    }
                }
            }
        }
        Ok(_) => {}
        Err(e) => {
            ctx.diagnostics.encode_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "frame encode failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::afe::{AfeConfig, WakeDetector};
    use crate::codec::pcm::PcmCodec;
    use crate::error::Result;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::thread;

    /// Scripted device: plays queued capture frames, then silence forever;
    /// records everything written to the speaker.
    struct ScriptedAudio {
        frames: VecDeque<Vec<i16>>,
        played: Arc<Mutex<Vec<i16>>>,
    }

    impl io::AudioIo for ScriptedAudio {
        fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize> {
            thread::sleep(Duration::from_millis(1));
            match self.frames.pop_front() {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                None => {
                    buf.fill(0);
                    Ok(buf.len())
                }
            }
        }

        fn play_frame(&mut self, pcm: &[i16]) -> Result<()> {
            self.played.lock().unwrap().extend_from_slice(pcm);
            Ok(())
        }
    }

    struct NeverWake;

    impl WakeDetector for NeverWake {
        fn process(&mut self, _frame: &[i16]) -> Option<usize> {
            None
        }

        fn reset(&mut self) {}
    }

    struct AlwaysWake;

    impl WakeDetector for AlwaysWake {
        fn process(&mut self, _frame: &[i16]) -> Option<usize> {
            Some(0)
        }

        fn reset(&mut self) {}
    }

    struct Harness {
        commands: Sender<AudioCommand>,
        playback: Sender<AudioPacket>,
        uplink: Receiver<AudioPacket>,
        events: Arc<EventBits>,
        pools: Arc<MemoryPools>,
        diagnostics: Arc<PipelineDiagnostics>,
        running: Arc<AtomicBool>,
        played: Arc<Mutex<Vec<i16>>>,
        worker: Option<thread::JoinHandle<()>>,
    }

    impl Harness {
        fn spawn(frames: VecDeque<Vec<i16>>, wake: Box<dyn WakeDetector>) -> Self {
            Self::spawn_with_barge_in(frames, wake, false)
        }

        fn spawn_with_barge_in(
            frames: VecDeque<Vec<i16>>,
            wake: Box<dyn WakeDetector>,
            acoustic_barge_in: bool,
        ) -> Self {
            let config = PipelineConfig {
                capture_frame_samples: 64,
                afe_chunk_samples: 64,
                silence_window: Duration::from_millis(60),
                short_utterance: Duration::from_millis(40),
                max_recording: Duration::from_secs(2),
                thinking_timeout: Duration::from_secs(5),
                aec_convergence: Duration::from_millis(50),
                playback_wait: Duration::from_millis(5),
                acoustic_barge_in,
                ..PipelineConfig::default()
            };
            let afe = FrontEnd::new(
                AfeConfig {
                    mic_channels: 2,
                    chunk_samples: 64,
                    enable_aec: false,
                    enable_ns: false,
                    ..AfeConfig::default()
                },
                wake,
            )
            .expect("front-end");

            let (cmd_tx, cmd_rx) = crossbeam_channel::bounded(4);
            let (play_tx, play_rx) = crossbeam_channel::bounded(24);
            let (uplink_tx, uplink_rx) = crossbeam_channel::bounded(8);
            let events = Arc::new(EventBits::new());
            let pools = Arc::new(MemoryPools::new());
            let diagnostics = Arc::new(PipelineDiagnostics::default());
            let running = Arc::new(AtomicBool::new(true));
            let played = Arc::new(Mutex::new(Vec::new()));

            // Uplink frames are short (64-sample chunks → 5 chunks/frame);
            // use a codec frame matching one chunk so packets flow quickly.
            let ctx = PipelineContext {
                config,
                audio: Box::new(ScriptedAudio {
                    frames,
                    played: Arc::clone(&played),
                }),
                afe,
                encoder: Box::new(PcmCodec::new(64)),
                decoder: Box::new(PcmCodec::new(960)),
                mic0: Arc::new(PcmRing::new(4096)),
                mic1: Arc::new(PcmRing::new(4096)),
                reference: Arc::new(PcmRing::new(4096)),
                pools: Arc::clone(&pools),
                commands: cmd_rx,
                playback: play_rx,
                uplink: uplink_tx,
                events: Arc::clone(&events),
                running: Arc::clone(&running),
                diagnostics: Arc::clone(&diagnostics),
            };

            let worker = thread::spawn(move || run(ctx));
            Self {
                commands: cmd_tx,
                playback: play_tx,
                uplink: uplink_rx,
                events,
                pools,
                diagnostics,
                running,
                played,
                worker: Some(worker),
            }
        }

        fn wait_for_event(&self, bit: u32, timeout: Duration) -> bool {
            let start = Instant::now();
            loop {
                if self.events.take() & bit != 0 {
                    return true;
                }
                if start.elapsed() >= timeout {
                    return false;
                }
                thread::sleep(Duration::from_millis(2));
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }

    fn stereo_frame(value: i16, mono: usize) -> Vec<i16> {
        vec![value; mono * 2]
    }

    #[test]
    fn recording_encodes_speech_then_posts_vad_end() {
        // ~400 ms of speech, then silence forever.
        let frames: VecDeque<Vec<i16>> = (0..100).map(|_| stereo_frame(8000, 64)).collect();
        let harness = Harness::spawn(frames, Box::new(NeverWake));

        harness.commands.send(AudioCommand::StartRecording).unwrap();

        let packet = harness
            .uplink
            .recv_timeout(Duration::from_secs(2))
            .expect("uplink packet");
        // PCM codec: 64 samples × 2 bytes, 3× gain applied to 8000 → 24000.
        assert_eq!(packet.len(), 128);
        let first = i16::from_le_bytes([packet.payload()[0], packet.payload()[1]]);
        assert_eq!(first, 24000);

        assert!(
            harness.wait_for_event(flags::VAD_END, Duration::from_secs(3)),
            "expected VAD_END after the silence window"
        );
    }

    #[test]
    fn silence_only_recording_cancels_short() {
        let harness = Harness::spawn(VecDeque::new(), Box::new(NeverWake));
        harness.commands.send(AudioCommand::StartRecording).unwrap();

        assert!(
            harness.wait_for_event(flags::SHORT_CANCEL, Duration::from_secs(3)),
            "expected SHORT_CANCEL for a speechless recording"
        );
        assert_eq!(
            harness
                .diagnostics
                .short_cancels
                .load(Ordering::Relaxed),
            1
        );
        // No uplink turn was produced.
        assert!(harness.uplink.try_recv().is_err());
    }

    #[test]
    fn playback_decodes_in_order_and_releases_blocks() {
        let harness = Harness::spawn(VecDeque::new(), Box::new(NeverWake));
        harness.commands.send(AudioCommand::StartPlayback).unwrap();

        // Three PCM packets with distinguishable first samples.
        for value in [11i16, 22, 33] {
            let pcm: Vec<u8> = vec![value, value, value]
                .iter()
                .flat_map(|s| s.to_le_bytes())
                .collect();
            let block = harness.pools.acquire_copy(&pcm).unwrap();
            harness.playback.send(AudioPacket { block }).unwrap();
        }

        let start = Instant::now();
        loop {
            if harness.diagnostics.packets_played.load(Ordering::Relaxed) >= 3 {
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(2), "playback stalled");
            thread::sleep(Duration::from_millis(5));
        }

        let played = harness.played.lock().unwrap().clone();
        assert_eq!(played, vec![11, 11, 11, 22, 22, 22, 33, 33, 33]);

        // Every packet block went back to its pool.
        thread::sleep(Duration::from_millis(20));
        let stats = harness.pools.stats();
        for class in stats.classes {
            assert_eq!(class.in_use, 0, "class {} leaked", class.class);
        }
    }

    #[test]
    fn acoustic_wake_fires_in_idle_but_not_during_playback() {
        let harness = Harness::spawn(VecDeque::new(), Box::new(AlwaysWake));

        assert!(
            harness.wait_for_event(flags::WAKE_DETECTED, Duration::from_secs(2)),
            "wake should fire while idle"
        );

        harness.commands.send(AudioCommand::StartPlayback).unwrap();
        thread::sleep(Duration::from_millis(100));
        harness.events.take();

        let suppressed_before = harness.diagnostics.wake_suppressed.load(Ordering::Relaxed);
        assert!(
            !harness.wait_for_event(flags::WAKE_DETECTED, Duration::from_millis(300)),
            "acoustic wake must stay muted during playback"
        );
        assert!(
            harness.diagnostics.wake_suppressed.load(Ordering::Relaxed) > suppressed_before,
            "suppressed wake events should be counted"
        );
    }

    #[test]
    fn barge_in_policy_lifts_the_playback_wake_mute() {
        let harness =
            Harness::spawn_with_barge_in(VecDeque::new(), Box::new(AlwaysWake), true);

        harness.commands.send(AudioCommand::StartPlayback).unwrap();
        thread::sleep(Duration::from_millis(100));
        harness.events.take();

        assert!(
            harness.wait_for_event(flags::WAKE_DETECTED, Duration::from_secs(2)),
            "with barge-in enabled, acoustic wake must pass during playback"
        );
    }
}
