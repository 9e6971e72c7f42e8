//! Control worker: session state machine, transport lifecycle, timeouts.
//!
//! ## Tick loop
//!
//! ```text
//! 0. Receive-queue intake (≤10 msgs): binary batches (state-guarded),
//!    JSON control messages, connect/disconnect events.
//! 1. Internal FSM event queue.
//! 2. Pipeline event bits (wake gating, handshake gating, endpoint events).
//! 3. State-specific work: uplink pump, drain-wait, timeouts, reconnect.
//! 4. Heartbeat / stats.
//! ```
//!
//! Ordering note: `tts_start` and its audio batches arrive on the same FIFO
//! receive queue, so Speaking is set synchronously on the text frame and no
//! subsequent batch can be dropped as out-of-state.

pub mod backoff;
pub mod session;

pub use session::SessionControl;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::buffering::MemoryPools;
use crate::config::ControlConfig;
use crate::identity::DeviceIdentity;
use crate::ipc::events::{SessionPhase, UiEvent};
use crate::ipc::flags::{self, EventBits};
use crate::ipc::AudioPacket;
use crate::pipeline::{AudioCommand, PipelineDiagnostics};
use crate::protocol::{
    AbortReason, ClientMessage, ListenMode, ListenState, MusicAction, ServerMessage,
    DEFAULT_EXPRESSION_MS,
};
use crate::transport::sink::{SinkCounters, TransportSink};
use crate::transport::{RawMessage, Transport, TransportFactory};
use backoff::backoff_delay;

/// Session state. Exactly one is active at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Recording,
    Speaking,
    Music,
    Error,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::Recording => "RECORDING",
            SessionState::Speaking => "SPEAKING",
            SessionState::Music => "MUSIC",
            SessionState::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    Voice,
    Touch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsmEvent {
    WakeDetected(WakeSource),
    RecordingEnd,
    TtsEnd,
    /// `tts_end` acknowledging a client abort.
    TtsAbort,
    WsConnected,
    WsDisconnected,
}

/// Counters owned by the control worker, exported for stats and tests.
#[derive(Debug, Default)]
pub struct ControlDiagnostics {
    /// Inbound packets accepted this session (reset on tts/music start).
    pub tts_rx: AtomicU64,
    /// Inbound packets dropped by the state guard.
    pub dropped_out_of_state: AtomicU64,
    /// Inbound packets dropped on pool exhaustion or enqueue timeout.
    pub dropped_backpressure: AtomicU64,
    /// Acoustic wake events muted during Speaking/Music.
    pub wake_muted: AtomicU64,
    /// Wake events ignored before the hello reply.
    pub wake_unacked: AtomicU64,
    /// Uplink packets sent to the server.
    pub tx_packets: AtomicU64,
    /// Completed hello handshakes.
    pub handshakes: AtomicU64,
    /// Reconnect attempts since boot.
    pub reconnects: AtomicU64,
    /// Short-cancelled recordings observed.
    pub short_cancels: AtomicU64,
}

/// Everything the worker needs, passed as one struct so the thread closure
/// stays tidy.
pub struct ControlContext {
    pub config: ControlConfig,
    pub identity: DeviceIdentity,
    pub factory: Box<dyn TransportFactory>,
    pub pools: Arc<MemoryPools>,
    /// Receive queue shared with the transport sinks.
    pub rx: Receiver<RawMessage>,
    /// Sender half handed to each new connection's sink.
    pub rx_sender: Sender<RawMessage>,
    pub sink_counters: Arc<SinkCounters>,
    pub audio_cmd: Sender<AudioCommand>,
    pub playback: Sender<AudioPacket>,
    /// Drain handle for the playback queue (flush on transitions).
    pub playback_drain: Receiver<AudioPacket>,
    pub uplink: Receiver<AudioPacket>,
    pub events: Arc<EventBits>,
    pub ui: broadcast::Sender<UiEvent>,
    pub session: Arc<SessionControl>,
    pub running: Arc<AtomicBool>,
    pub diagnostics: Arc<ControlDiagnostics>,
    pub pipeline_diagnostics: Arc<PipelineDiagnostics>,
}

struct ControlState {
    fsm: SessionState,
    transport: Option<Box<dyn Transport>>,
    connected: bool,
    hello_acked: bool,
    session_id: Option<String>,
    server_abort_supported: bool,
    listen_start_sent: bool,
    tts_end_received: bool,
    drain_count: u32,
    /// Instant of the last accepted inbound packet (or Speaking entry).
    speaking_last_packet: Option<Instant>,
    stall_warned: [bool; 2],
    thinking_start: Option<Instant>,
    recording_start: Option<Instant>,
    music_was_playing: bool,
    music_flag_since: Option<Instant>,
    reconnect_attempts: u32,
    next_reconnect_at: Option<Instant>,
    last_countdown: Option<u64>,
    fsm_queue: VecDeque<FsmEvent>,
    last_heartbeat: Instant,
    last_energy: Instant,
}

/// Run the control worker until `ctx.running` goes false.
pub fn run(mut ctx: ControlContext) {
    let mut state = ControlState {
        fsm: SessionState::Idle,
        transport: None,
        connected: false,
        hello_acked: false,
        session_id: None,
        server_abort_supported: false,
        listen_start_sent: false,
        tts_end_received: false,
        drain_count: 0,
        speaking_last_packet: None,
        stall_warned: [false, false],
        thinking_start: None,
        recording_start: None,
        music_was_playing: false,
        music_flag_since: None,
        reconnect_attempts: 0,
        next_reconnect_at: None,
        last_countdown: None,
        fsm_queue: VecDeque::new(),
        last_heartbeat: Instant::now(),
        last_energy: Instant::now(),
    };

    info!(device_id = %ctx.identity.device_id, "control worker starting");
    ui(&ctx, UiEvent::Status {
        text: "Connecting to server...".into(),
    });
    attempt_connect(&mut ctx, &mut state);

    while ctx.running.load(Ordering::Acquire) {
        if ctx.session.take_close_request() {
            if let Some(transport) = &state.transport {
                info!("closing transport on session controller request");
                transport.close();
            }
        }

        process_rx(&mut ctx, &mut state);

        while let Some(event) = state.fsm_queue.pop_front() {
            fsm_handle_event(&mut ctx, &mut state, event);
        }

        process_event_bits(&mut ctx, &mut state);
        state_actions(&mut ctx, &mut state);
        heartbeat(&ctx, &mut state);

        std::thread::sleep(ctx.config.tick);
    }

    if let Some(transport) = &state.transport {
        transport.close();
    }
    info!("control worker exiting");
}

fn ui(ctx: &ControlContext, event: UiEvent) {
    let _ = ctx.ui.send(event);
}

fn set_phase(ctx: &ControlContext, phase: SessionPhase) {
    ui(ctx, UiEvent::Phase { phase });
}

fn send_message(state: &mut ControlState, msg: &ClientMessage) -> bool {
    let Some(transport) = &state.transport else {
        warn!("no transport, message dropped");
        return false;
    };
    if !transport.is_connected() {
        warn!("transport not connected, message dropped");
        return false;
    }
    let json = msg.to_json();
    match transport.send_text(&json) {
        Ok(()) => {
            info!(msg = %json, "-> server");
            true
        }
        Err(e) => {
            warn!(error = %e, "send failed");
            false
        }
    }
}

fn send_listen(state: &mut ControlState, listen: ListenState, mode: Option<ListenMode>, text: Option<&str>) -> bool {
    send_message(
        state,
        &ClientMessage::Listen {
            state: listen,
            mode,
            text: text.map(str::to_string),
        },
    )
}

fn send_abort(state: &mut ControlState, reason: AbortReason) {
    send_message(
        state,
        &ClientMessage::Abort {
            reason: Some(reason),
        },
    );
}

fn command_audio(ctx: &ControlContext, cmd: AudioCommand) {
    if ctx.audio_cmd.try_send(cmd).is_err() {
        warn!(?cmd, "audio command queue full");
    }
}

/// Drain the playback queue, releasing the pool blocks of pending packets.
fn flush_playback(ctx: &ControlContext) {
    let mut flushed = 0;
    while ctx.playback_drain.try_recv().is_ok() {
        flushed += 1;
    }
    if flushed > 0 {
        info!(flushed, "playback queue flushed");
    }
}

/// Drain the transport receive queue, releasing pool blocks.
fn drain_rx(ctx: &ControlContext) {
    let mut drained = 0;
    while let Ok(msg) = ctx.rx.try_recv() {
        drained += 1;
        drop(msg);
    }
    if drained > 0 {
        warn!(drained, "stale receive-queue messages drained");
    }
}

// ---------------------------------------------------------------------------
// Receive queue
// ---------------------------------------------------------------------------

fn process_rx(ctx: &mut ControlContext, state: &mut ControlState) {
    for _ in 0..ctx.config.max_rx_per_tick {
        let Ok(msg) = ctx.rx.try_recv() else { break };
        match msg {
            RawMessage::Binary(block) => {
                handle_binary(ctx, state, block.as_slice());
                // block drops here, releasing the batch buffer.
            }
            RawMessage::Text(block) => {
                if let Some(msg) = ServerMessage::parse(block.as_slice()) {
                    handle_server_message(ctx, state, msg);
                }
            }
            RawMessage::Connected => handle_connected(ctx, state),
            RawMessage::Disconnected => handle_disconnected(ctx, state),
        }
    }
}

fn handle_connected(ctx: &mut ControlContext, state: &mut ControlState) {
    info!("transport connected");
    state.connected = true;
    state.hello_acked = false;
    state.session_id = None;
    state.next_reconnect_at = None;

    send_message(
        state,
        &ClientMessage::Hello {
            device_id: ctx.identity.device_id.clone(),
            fw: ctx.config.firmware_version.clone(),
            listen_mode: ListenMode::Auto,
        },
    );
    state.fsm_queue.push_back(FsmEvent::WsConnected);
}

fn handle_disconnected(ctx: &mut ControlContext, state: &mut ControlState) {
    warn!(
        fsm = state.fsm.name(),
        tts_rx = ctx.diagnostics.tts_rx.load(Ordering::Relaxed),
        "transport disconnected"
    );
    state.connected = false;
    state.hello_acked = false;
    state.session_id = None;
    state.transport = None;

    // Release every pool block still queued on either side.
    drain_rx(ctx);
    flush_playback(ctx);
    ui(ctx, UiEvent::PlaybackEnergy { energy: 0.0 });

    if ctx.session.reconnect_suppressed() {
        // Intentional close for the firmware update; not an error.
        info!("transport closed during update, reconnect suppressed");
        ui(ctx, UiEvent::Status {
            text: "Updating firmware...".into(),
        });
        return;
    }

    ui(ctx, UiEvent::Status {
        text: "Server lost".into(),
    });
    state.fsm_queue.push_back(FsmEvent::WsDisconnected);
}

/// One inbound audio batch: `[len_be16][payload]*`.
fn handle_binary(ctx: &mut ControlContext, state: &mut ControlState, batch: &[u8]) {
    // Only Speaking and Music admit inbound audio.
    if state.fsm != SessionState::Speaking && state.fsm != SessionState::Music {
        let dropped = ctx
            .diagnostics
            .dropped_out_of_state
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if dropped <= 5 || dropped % 20 == 0 {
            warn!(fsm = state.fsm.name(), dropped, "audio batch dropped out of state");
        }
        return;
    }

    // Music has no starvation timeout; only Speaking tracks packet gaps.
    if state.fsm == SessionState::Speaking {
        state.speaking_last_packet = Some(Instant::now());
        state.stall_warned = [false, false];
    }

    let mut parsed = 0u32;
    for packet in crate::protocol::parse_batch(batch) {
        ctx.diagnostics.tts_rx.fetch_add(1, Ordering::Relaxed);

        let Some(block) = ctx.pools.acquire_copy(packet) else {
            ctx.diagnostics
                .dropped_backpressure
                .fetch_add(1, Ordering::Relaxed);
            warn!(parsed, "pool exhausted mid-batch");
            break;
        };
        // Bounded wait for a playback slot; on timeout drop only this
        // packet and keep parsing so the batch tail is not lost.
        if ctx
            .playback
            .send_timeout(AudioPacket { block }, ctx.config.playback_enqueue_wait)
            .is_err()
        {
            ctx.diagnostics
                .dropped_backpressure
                .fetch_add(1, Ordering::Relaxed);
            continue;
        }
        parsed += 1;
    }
    if parsed > 0 {
        debug!(
            parsed,
            queue = ctx.playback.len(),
            total_rx = ctx.diagnostics.tts_rx.load(Ordering::Relaxed),
            "audio batch enqueued"
        );
    }
}

fn reset_session_counters(ctx: &ControlContext) {
    ctx.diagnostics.tts_rx.store(0, Ordering::Relaxed);
    ctx.diagnostics.dropped_out_of_state.store(0, Ordering::Relaxed);
    ctx.diagnostics.dropped_backpressure.store(0, Ordering::Relaxed);
}

fn handle_server_message(ctx: &mut ControlContext, state: &mut ControlState, msg: ServerMessage) {
    match msg {
        ServerMessage::Hello {
            session_id,
            features,
        } => {
            state.hello_acked = true;
            state.session_id = session_id;
            state.server_abort_supported = features.map(|f| f.abort).unwrap_or(false);
            // A successful handshake resets the backoff schedule.
            state.reconnect_attempts = 0;
            ctx.diagnostics.handshakes.fetch_add(1, Ordering::Relaxed);
            info!(
                session = state.session_id.as_deref().unwrap_or("none"),
                abort_supported = state.server_abort_supported,
                "handshake complete"
            );
            ui(ctx, UiEvent::Status {
                text: "Connected".into(),
            });
        }

        ServerMessage::TtsStart { text } => {
            if let Some(text) = &text {
                info!(text = %text, "tts start");
            }
            let prev = state.fsm;
            // Synchronous transition: batches behind this frame on the FIFO
            // receive queue must all be accepted.
            state.fsm = SessionState::Speaking;
            state.speaking_last_packet = Some(Instant::now());
            state.stall_warned = [false, false];
            state.thinking_start = None;
            state.tts_end_received = false;
            state.drain_count = 0;
            reset_session_counters(ctx);

            if prev == SessionState::Recording {
                command_audio(ctx, AudioCommand::StopRecording);
                state.listen_start_sent = false;
                state.recording_start = None;
            }
            command_audio(ctx, AudioCommand::StartPlayback);
            set_phase(ctx, SessionPhase::Speaking);
            info!(from = prev.name(), "fsm -> SPEAKING (tts_start)");
        }

        ServerMessage::TtsEnd { reason } => {
            info!(
                rx = ctx.diagnostics.tts_rx.load(Ordering::Relaxed),
                reason = reason.as_deref().unwrap_or(""),
                "tts end"
            );
            if reason.as_deref() == Some("abort") {
                state.fsm_queue.push_back(FsmEvent::TtsAbort);
            } else {
                state.fsm_queue.push_back(FsmEvent::TtsEnd);
            }
        }

        ServerMessage::MusicStart { title } => {
            let prev = state.fsm;
            state.fsm = SessionState::Music;
            state.tts_end_received = false;
            state.drain_count = 0;
            state.music_was_playing = false;
            state.music_flag_since = None;
            reset_session_counters(ctx);

            // Flush stale events (e.g. the tts_end of a hint utterance sent
            // just before music_start); processed after this transition it
            // would terminate the new music session prematurely.
            let stale = state.fsm_queue.len();
            state.fsm_queue.clear();
            if stale > 0 {
                warn!(stale, "stale fsm events flushed on music_start");
            }

            if prev == SessionState::Recording {
                command_audio(ctx, AudioCommand::StopRecording);
                state.listen_start_sent = false;
                state.recording_start = None;
            }
            command_audio(ctx, AudioCommand::StartPlayback);
            set_phase(ctx, SessionPhase::Music);
            ui(ctx, UiEvent::MusicTitle {
                title: title.clone(),
            });
            info!(from = prev.name(), title = title.as_deref().unwrap_or(""), "fsm -> MUSIC");
        }

        ServerMessage::MusicEnd { .. } => {
            ui(ctx, UiEvent::MusicTitle { title: None });
            if state.fsm == SessionState::Music {
                state.fsm_queue.push_back(FsmEvent::TtsEnd);
            } else {
                debug!(fsm = state.fsm.name(), "music_end ignored outside MUSIC");
                state.music_was_playing = false;
            }
        }

        ServerMessage::MusicResume { title } => {
            if state.music_was_playing {
                state.fsm = SessionState::Music;
                state.tts_end_received = false;
                state.drain_count = 0;
                state.music_was_playing = false;
                state.music_flag_since = None;
                state.fsm_queue.clear();

                command_audio(ctx, AudioCommand::StartPlayback);
                set_phase(ctx, SessionPhase::Music);
                if title.is_some() {
                    ui(ctx, UiEvent::MusicTitle { title });
                }
                info!("fsm -> MUSIC (resume)");
            } else {
                debug!("music_resume ignored, no paused music");
            }
        }

        ServerMessage::AsrText { text } => {
            if let Some(text) = text {
                info!(text = %text, "asr result");
                ui(ctx, UiEvent::AsrText { text });
            }
        }

        ServerMessage::Error { message } => {
            let message = message.unwrap_or_default();
            warn!(message = %message, "server error");
            if state.thinking_start.take().is_some() {
                // Thinking aborted by the server; reset the UI to idle.
                set_phase(ctx, SessionPhase::Idle);
                ui(ctx, UiEvent::Status {
                    text: "Server error".into(),
                });
            } else {
                ui(ctx, UiEvent::Status {
                    text: format!("Server error: {message}"),
                });
            }
        }

        ServerMessage::Expression { expr, duration_ms } => {
            ui(ctx, UiEvent::Expression {
                expr,
                duration_ms: duration_ms.unwrap_or(DEFAULT_EXPRESSION_MS),
            });
        }

        ServerMessage::Pong => debug!("server pong"),

        ServerMessage::OtaNotify { version, url } => {
            if version != ctx.config.firmware_version {
                info!(version = %version, url = %url, "firmware update available");
                ui(ctx, UiEvent::OtaAvailable { version, url });
            } else {
                info!(version = %version, "already on announced firmware");
            }
        }

        ServerMessage::Unknown => debug!("unknown server message type"),
    }
}

// ---------------------------------------------------------------------------
// Pipeline event bits
// ---------------------------------------------------------------------------

fn process_event_bits(ctx: &mut ControlContext, state: &mut ControlState) {
    let bits = ctx.events.take();
    if bits == 0 {
        return;
    }

    if bits & flags::WAKE_DETECTED != 0 {
        if !state.hello_acked {
            ctx.diagnostics.wake_unacked.fetch_add(1, Ordering::Relaxed);
            debug!("wake ignored before handshake");
        } else if matches!(state.fsm, SessionState::Speaking | SessionState::Music)
            && !ctx.config.acoustic_barge_in
        {
            // Without a known-convergent echo canceller, acoustic wake during
            // playback is speaker echo more often than a user.
            ctx.diagnostics.wake_muted.fetch_add(1, Ordering::Relaxed);
            warn!(fsm = state.fsm.name(), "acoustic wake muted during playback");
        } else {
            state
                .fsm_queue
                .push_back(FsmEvent::WakeDetected(WakeSource::Voice));
        }
    }

    if bits & flags::TOUCH_WAKE != 0 {
        if !state.hello_acked {
            ctx.diagnostics.wake_unacked.fetch_add(1, Ordering::Relaxed);
            debug!("touch wake ignored before handshake");
        } else {
            // Touch is unambiguous: honoured in every state.
            info!(fsm = state.fsm.name(), "touch wake");
            state
                .fsm_queue
                .push_back(FsmEvent::WakeDetected(WakeSource::Touch));
        }
    }

    if bits & flags::VAD_END != 0 && state.fsm == SessionState::Recording {
        state.fsm_queue.push_back(FsmEvent::RecordingEnd);
    }

    if bits & flags::SHORT_CANCEL != 0 && state.fsm == SessionState::Recording {
        // Nothing was worth sending; no server turn, no listen{stop}.
        info!("short recording cancelled");
        ctx.diagnostics.short_cancels.fetch_add(1, Ordering::Relaxed);
        state.fsm = SessionState::Idle;
        state.recording_start = None;
        state.listen_start_sent = false;
        set_phase(ctx, SessionPhase::Idle);
        ui(ctx, UiEvent::Status {
            text: format!("Say '{}'", ctx.config.wake_phrase),
        });
    }
}

// ---------------------------------------------------------------------------
// FSM
// ---------------------------------------------------------------------------

fn enter_recording(ctx: &mut ControlContext, state: &mut ControlState) {
    state.fsm = SessionState::Recording;
    state.thinking_start = None;
    state.recording_start = Some(Instant::now());

    let wake_phrase = ctx.config.wake_phrase.clone();
    send_listen(state, ListenState::Detect, None, Some(wake_phrase.as_str()));
    state.listen_start_sent = send_listen(state, ListenState::Start, Some(ListenMode::Auto), None);

    command_audio(ctx, AudioCommand::StartRecording);
    set_phase(ctx, SessionPhase::Recording);
}

fn enter_error(ctx: &mut ControlContext, state: &mut ControlState) {
    state.fsm = SessionState::Error;
    state.tts_end_received = false;
    state.drain_count = 0;
    state.speaking_last_packet = None;
    state.recording_start = None;
    state.listen_start_sent = false;
    state.music_was_playing = false;
    state.next_reconnect_at = None;
    state.last_countdown = None;

    drain_rx(ctx);
    flush_playback(ctx);
    set_phase(ctx, SessionPhase::Error);
}

fn fsm_handle_event(ctx: &mut ControlContext, state: &mut ControlState, event: FsmEvent) {
    let old = state.fsm;

    match state.fsm {
        SessionState::Idle => match event {
            FsmEvent::WakeDetected(source) => {
                info!(?source, "wake detected, entering recording");
                enter_recording(ctx, state);
            }
            FsmEvent::WsConnected => {
                set_phase(ctx, SessionPhase::Idle);
            }
            FsmEvent::WsDisconnected => enter_error(ctx, state),
            _ => {}
        },

        SessionState::Recording => match event {
            // Already listening; a repeated wake changes nothing.
            FsmEvent::WakeDetected(_) => {}
            FsmEvent::RecordingEnd => {
                state.fsm = SessionState::Idle;
                state.recording_start = None;
                state.thinking_start = Some(Instant::now());

                if !state.listen_start_sent && state.connected {
                    // The start marker never went out (send failure at wake
                    // time); the server needs it before the stop.
                    warn!("listen start was not sent earlier, sending now");
                    send_listen(state, ListenState::Start, Some(ListenMode::Auto), None);
                }
                send_listen(state, ListenState::Stop, None, None);
                state.listen_start_sent = false;

                command_audio(ctx, AudioCommand::StopRecording);
                set_phase(ctx, SessionPhase::Thinking);
            }
            FsmEvent::WsDisconnected => {
                command_audio(ctx, AudioCommand::StopRecording);
                enter_error(ctx, state);
            }
            _ => {}
        },

        SessionState::Speaking => match event {
            FsmEvent::TtsEnd | FsmEvent::TtsAbort => {
                state.tts_end_received = true;
                state.drain_count = 0;
                debug!("tts end received, waiting for playback drain");
            }
            FsmEvent::WakeDetected(source) => {
                // Barge-in: abort the reply and record the new utterance.
                info!(?source, "wake during SPEAKING, aborting tts");
                send_abort(state, AbortReason::WakeWordDetected);
                command_audio(ctx, AudioCommand::StopPlayback);
                flush_playback(ctx);
                ui(ctx, UiEvent::PlaybackEnergy { energy: 0.0 });
                state.tts_end_received = false;
                state.drain_count = 0;
                state.speaking_last_packet = None;
                enter_recording(ctx, state);
            }
            FsmEvent::WsDisconnected => {
                command_audio(ctx, AudioCommand::StopPlayback);
                enter_error(ctx, state);
            }
            _ => {}
        },

        SessionState::Music => match event {
            FsmEvent::TtsEnd | FsmEvent::TtsAbort => {
                state.tts_end_received = true;
                state.drain_count = 0;
            }
            FsmEvent::WakeDetected(source) => {
                info!(?source, "wake during MUSIC, pausing");
                send_message(
                    state,
                    &ClientMessage::MusicCtrl {
                        action: MusicAction::Pause,
                    },
                );
                command_audio(ctx, AudioCommand::StopPlayback);
                flush_playback(ctx);
                ui(ctx, UiEvent::PlaybackEnergy { energy: 0.0 });
                state.tts_end_received = false;
                state.drain_count = 0;
                state.music_was_playing = true;
                state.music_flag_since = Some(Instant::now());
                enter_recording(ctx, state);
            }
            FsmEvent::WsDisconnected => {
                command_audio(ctx, AudioCommand::StopPlayback);
                ui(ctx, UiEvent::PlaybackEnergy { energy: 0.0 });
                enter_error(ctx, state);
            }
            _ => {}
        },

        SessionState::Error => {
            if event == FsmEvent::WsConnected {
                state.fsm = SessionState::Idle;
                info!("reconnected, recovering to IDLE");
                set_phase(ctx, SessionPhase::Idle);
            }
        }
    }

    if old != state.fsm {
        info!(from = old.name(), to = state.fsm.name(), "fsm transition");
    }
}

// ---------------------------------------------------------------------------
// Per-state periodic work
// ---------------------------------------------------------------------------

fn state_actions(ctx: &mut ControlContext, state: &mut ControlState) {
    match state.fsm {
        SessionState::Recording => recording_actions(ctx, state),
        SessionState::Speaking => speaking_actions(ctx, state),
        SessionState::Music => music_actions(ctx, state),
        SessionState::Error => error_actions(ctx, state),
        SessionState::Idle => idle_actions(ctx, state),
    }
}

fn recording_actions(ctx: &mut ControlContext, state: &mut ControlState) {
    // Hard cap regardless of VAD; the pipeline enforces its own shorter cap.
    if let Some(start) = state.recording_start {
        if start.elapsed() > ctx.config.recording_cap {
            warn!(
                cap_ms = ctx.config.recording_cap.as_millis() as u64,
                "recording cap reached, forcing end"
            );
            state.recording_start = None;
            state.fsm_queue.push_back(FsmEvent::RecordingEnd);
            return;
        }
    }

    if !state.listen_start_sent && state.connected && state.hello_acked {
        state.listen_start_sent =
            send_listen(state, ListenState::Start, Some(ListenMode::Auto), None);
    }

    // Pump encoded uplink packets, bounded per tick.
    for _ in 0..ctx.config.max_tx_per_tick {
        let Ok(packet) = ctx.uplink.try_recv() else { break };
        let sent = state
            .transport
            .as_ref()
            .filter(|t| t.is_connected())
            .map(|t| t.send_binary(packet.payload()).is_ok())
            .unwrap_or(false);
        if sent {
            let sent_total = ctx.diagnostics.tx_packets.fetch_add(1, Ordering::Relaxed) + 1;
            if sent_total % 20 == 0 {
                debug!(sent_total, "uplink packets sent");
            }
        }
        // Packet drops here either way; offline packets are simply counted
        // by their absence.
    }
}

fn speaking_actions(ctx: &mut ControlContext, state: &mut ControlState) {
    forward_playback_energy(ctx, state);

    // Starvation diagnostics and timeout, measured from the last packet.
    if let Some(last) = state.speaking_last_packet {
        let gap = last.elapsed();
        for (i, warn_at) in ctx.config.stall_warnings.iter().enumerate() {
            if gap > *warn_at && !state.stall_warned[i] {
                state.stall_warned[i] = true;
                warn!(
                    gap_ms = gap.as_millis() as u64,
                    rx = ctx.diagnostics.tts_rx.load(Ordering::Relaxed),
                    "no inbound packet"
                );
            }
        }

        if gap > ctx.config.speaking_timeout {
            warn!(
                gap_ms = gap.as_millis() as u64,
                "speaking starved, aborting"
            );
            send_abort(state, AbortReason::SpeakingTimeout);
            state.tts_end_received = false;
            state.drain_count = 0;
            state.speaking_last_packet = None;

            command_audio(ctx, AudioCommand::StopPlayback);
            flush_playback(ctx);
            state.fsm = SessionState::Idle;
            set_phase(ctx, SessionPhase::Idle);
            return;
        }
    }

    drain_wait(ctx, state);
}

fn music_actions(ctx: &mut ControlContext, state: &mut ControlState) {
    forward_playback_energy(ctx, state);
    // No starvation timeout: music stream pacing is not bounded.
    drain_wait(ctx, state);
}

/// Two-stage exit from Speaking/Music: after `tts_end`, the playback queue
/// must be observed empty for N consecutive ticks (≈100 ms) before leaving,
/// so the last packet has actually been played, not merely dequeued.
fn drain_wait(ctx: &mut ControlContext, state: &mut ControlState) {
    if !state.tts_end_received {
        return;
    }
    if ctx.playback.len() > 0 {
        state.drain_count = 0;
        return;
    }
    state.drain_count += 1;
    if state.drain_count < ctx.config.drain_observations {
        return;
    }

    state.tts_end_received = false;
    state.drain_count = 0;
    state.speaking_last_packet = None;
    command_audio(ctx, AudioCommand::StopPlayback);
    ui(ctx, UiEvent::PlaybackEnergy { energy: 0.0 });

    if ctx.config.auto_listen && state.connected {
        // Configurable policy, off by default: an unmuted speaker tail can
        // trigger the next VAD cycle and loop.
        info!("playback drained, auto-listen entering recording");
        state.listen_start_sent =
            send_listen(state, ListenState::Start, Some(ListenMode::Auto), None);
        state.fsm = SessionState::Recording;
        state.recording_start = Some(Instant::now());
        command_audio(ctx, AudioCommand::StartRecording);
        set_phase(ctx, SessionPhase::Recording);
    } else if state.music_was_playing && state.connected {
        info!("playback drained, requesting music resume");
        send_message(
            state,
            &ClientMessage::MusicCtrl {
                action: MusicAction::Resume,
            },
        );
        state.music_flag_since = Some(Instant::now());
        state.fsm = SessionState::Idle;
        set_phase(ctx, SessionPhase::Idle);
    } else {
        info!("playback drained, entering IDLE");
        state.music_was_playing = false;
        state.fsm = SessionState::Idle;
        set_phase(ctx, SessionPhase::Idle);
    }
}

fn forward_playback_energy(ctx: &ControlContext, state: &mut ControlState) {
    if state.last_energy.elapsed() >= Duration::from_millis(200) {
        state.last_energy = Instant::now();
        ui(ctx, UiEvent::PlaybackEnergy {
            energy: ctx.pipeline_diagnostics.playback_energy(),
        });
    }
}

fn idle_actions(ctx: &mut ControlContext, state: &mut ControlState) {
    // Thinking timeout: the server never sent tts_start.
    if let Some(start) = state.thinking_start {
        if start.elapsed() > ctx.config.thinking_timeout {
            warn!(
                timeout_ms = ctx.config.thinking_timeout.as_millis() as u64,
                "thinking timed out without a server reply"
            );
            state.thinking_start = None;
            set_phase(ctx, SessionPhase::Idle);
            ui(ctx, UiEvent::Status {
                text: "Connected".into(),
            });
        }
    }

    // Safety net: a missed disconnect event must not leave the session
    // stranded in IDLE.
    if !state.connected && state.hello_acked && !ctx.session.reconnect_suppressed() {
        warn!("idle with a dead transport, forcing ERROR for reconnect");
        state.hello_acked = false;
        state.session_id = None;
        enter_error(ctx, state);
        return;
    }

    // A resume request that never got an answer must not pin the flag.
    if state.music_was_playing {
        if let Some(since) = state.music_flag_since {
            if since.elapsed() > ctx.config.music_flag_timeout {
                warn!("music resume flag stuck, clearing");
                state.music_was_playing = false;
                state.music_flag_since = None;
            }
        }
    }
}

fn error_actions(ctx: &mut ControlContext, state: &mut ControlState) {
    if ctx.session.reconnect_suppressed() {
        return;
    }

    let now = Instant::now();
    let delay = backoff_delay(
        state.reconnect_attempts,
        ctx.config.backoff_base,
        ctx.config.backoff_max,
    );
    let deadline = *state.next_reconnect_at.get_or_insert(now + delay);

    if now < deadline {
        let remaining = deadline.duration_since(now).as_secs();
        if state.last_countdown != Some(remaining) {
            state.last_countdown = Some(remaining);
            ui(ctx, UiEvent::ReconnectCountdown { seconds: remaining });
        }
        return;
    }

    info!(
        attempt = state.reconnect_attempts + 1,
        backoff_ms = delay.as_millis() as u64,
        "reconnect attempt"
    );
    state.reconnect_attempts += 1;
    ctx.diagnostics.reconnects.fetch_add(1, Ordering::Relaxed);
    state.next_reconnect_at = None;
    state.last_countdown = None;
    attempt_connect(ctx, state);
}

/// Full client re-init: the old instance is destroyed and a fresh one
/// connects, so headers and the handshake are sent cleanly every time.
fn attempt_connect(ctx: &mut ControlContext, state: &mut ControlState) {
    state.transport = None;

    let sink = TransportSink::new(
        Arc::clone(&ctx.pools),
        ctx.rx_sender.clone(),
        Arc::clone(&ctx.sink_counters),
    );
    match ctx.factory.connect(sink) {
        Ok(transport) => {
            state.transport = Some(transport);
            // The Connected event arrives through the receive queue.
        }
        Err(e) => {
            warn!(error = %e, "connect failed");
            if state.fsm != SessionState::Error {
                state.fsm_queue.push_back(FsmEvent::WsDisconnected);
            }
        }
    }
}

fn heartbeat(ctx: &ControlContext, state: &mut ControlState) {
    if state.last_heartbeat.elapsed() < ctx.config.heartbeat_interval {
        return;
    }
    state.last_heartbeat = Instant::now();
    info!(
        state = state.fsm.name(),
        connected = state.connected,
        hello = state.hello_acked,
        session = state.session_id.as_deref().unwrap_or("none"),
        tx = ctx.diagnostics.tx_packets.load(Ordering::Relaxed),
        rx = ctx.diagnostics.tts_rx.load(Ordering::Relaxed),
        rx_queue = ctx.rx.len(),
        playback_queue = ctx.playback.len(),
        sink_queue_full = ctx.sink_counters.queue_full.load(Ordering::Relaxed),
        "heartbeat"
    );
}
