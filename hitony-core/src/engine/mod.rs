//! `VoiceEngine` — top-level lifecycle controller.
//!
//! ## Topology
//!
//! ```text
//!            ┌──────────────┐  commands(4)   ┌──────────────┐
//!            │  audio-main  │◄───────────────│  main-ctrl   │
//!  AudioIo──►│ (pipeline A) │  uplink(8)     │ (control B)  │◄── transport
//!            │  + afe worker│───────────────►│              │    sink (C)
//!            └──────────────┘  playback(24)  └──────────────┘
//!                    ▲         ◄───────────────     │
//!              PCM rings (mic0, mic1, ref)          ▼
//!                                            UiEvent broadcast
//! ```
//!
//! Both workers share only bounded queues, the event-bit set and the pools.
//! `start()`/`stop()` are guarded: calling them in the wrong state returns an
//! error rather than panicking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::afe::{AfeConfig, FrontEnd, WakeDetector};
use crate::buffering::{MemoryPools, PcmRing, PoolStats};
use crate::codec::{AudioDecoder, AudioEncoder};
use crate::config::{ControlConfig, PipelineConfig};
use crate::control::{self, ControlContext, ControlDiagnostics, SessionControl};
use crate::error::{HitonyError, Result};
use crate::identity::DeviceIdentity;
use crate::ipc::events::UiEvent;
use crate::ipc::flags::{self, EventBits};
use crate::pipeline::{self, io::AudioIo, PipelineContext, PipelineDiagnostics};
use crate::transport::sink::SinkCounters;
use crate::transport::TransportFactory;

/// Queue capacities, sized to the worst-case in-flight counts.
const CMD_QUEUE: usize = 4;
const UPLINK_QUEUE: usize = 8;
const PLAYBACK_QUEUE: usize = 24;
const RX_QUEUE: usize = 48;

/// PCM ring capacities in samples.
const MIC_RING: usize = 8192;
const AUX_RING: usize = 4096;

/// UI broadcast buffer for slow subscribers.
const BROADCAST_CAP: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pipeline: PipelineConfig,
    pub control: ControlConfig,
    pub afe: AfeConfig,
    /// Hardware unique identifier the device identity derives from.
    pub mac: [u8; 6],
}

/// The top-level engine handle. All fields use interior mutability; wrap in
/// `Arc<VoiceEngine>` to share with collaborators.
pub struct VoiceEngine {
    config: EngineConfig,
    identity: DeviceIdentity,
    running: Arc<AtomicBool>,
    events: Arc<EventBits>,
    ui_tx: broadcast::Sender<UiEvent>,
    session: Arc<SessionControl>,
    pools: Arc<MemoryPools>,
    pipeline_diagnostics: Arc<PipelineDiagnostics>,
    control_diagnostics: Arc<ControlDiagnostics>,
    sink_counters: Arc<SinkCounters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (ui_tx, _) = broadcast::channel(BROADCAST_CAP);
        let identity = DeviceIdentity::from_mac(config.mac);
        Self {
            config,
            identity,
            running: Arc::new(AtomicBool::new(false)),
            events: Arc::new(EventBits::new()),
            ui_tx,
            session: Arc::new(SessionControl::new()),
            pools: Arc::new(MemoryPools::new()),
            pipeline_diagnostics: Arc::new(PipelineDiagnostics::default()),
            control_diagnostics: Arc::new(ControlDiagnostics::default()),
            sink_counters: Arc::new(SinkCounters::default()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start both workers with the given collaborators.
    ///
    /// # Errors
    /// - `HitonyError::AlreadyRunning` if already started.
    /// - Front-end errors if the worker cannot be created.
    pub fn start(
        &self,
        audio: Box<dyn AudioIo>,
        factory: Box<dyn TransportFactory>,
        encoder: Box<dyn AudioEncoder>,
        decoder: Box<dyn AudioDecoder>,
        wake: Box<dyn WakeDetector>,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(HitonyError::AlreadyRunning);
        }

        let afe = FrontEnd::new(self.config.afe.clone(), wake)?;

        let (cmd_tx, cmd_rx) = bounded(CMD_QUEUE);
        let (uplink_tx, uplink_rx) = bounded(UPLINK_QUEUE);
        let (playback_tx, playback_rx) = bounded(PLAYBACK_QUEUE);
        let (rx_tx, rx_rx) = bounded(RX_QUEUE);

        // One policy switch governs both sides of the wake gate.
        let mut pipeline_config = self.config.pipeline.clone();
        pipeline_config.acoustic_barge_in = self.config.control.acoustic_barge_in;

        let pipeline_ctx = PipelineContext {
            config: pipeline_config,
            audio,
            afe,
            encoder,
            decoder,
            mic0: Arc::new(PcmRing::new(MIC_RING)),
            mic1: Arc::new(PcmRing::new(AUX_RING)),
            reference: Arc::new(PcmRing::new(AUX_RING)),
            pools: Arc::clone(&self.pools),
            commands: cmd_rx,
            playback: playback_rx.clone(),
            uplink: uplink_tx,
            events: Arc::clone(&self.events),
            running: Arc::clone(&self.running),
            diagnostics: Arc::clone(&self.pipeline_diagnostics),
        };

        let control_ctx = ControlContext {
            config: self.config.control.clone(),
            identity: self.identity.clone(),
            factory,
            pools: Arc::clone(&self.pools),
            rx: rx_rx,
            rx_sender: rx_tx,
            sink_counters: Arc::clone(&self.sink_counters),
            audio_cmd: cmd_tx,
            playback: playback_tx,
            playback_drain: playback_rx,
            uplink: uplink_rx,
            events: Arc::clone(&self.events),
            ui: self.ui_tx.clone(),
            session: Arc::clone(&self.session),
            running: Arc::clone(&self.running),
            diagnostics: Arc::clone(&self.control_diagnostics),
            pipeline_diagnostics: Arc::clone(&self.pipeline_diagnostics),
        };

        let audio_worker = std::thread::Builder::new()
            .name("audio-main".into())
            .spawn(move || pipeline::run(pipeline_ctx))
            .map_err(|e| HitonyError::Other(anyhow::anyhow!("spawn audio-main: {e}")))?;
        let control_worker = std::thread::Builder::new()
            .name("main-ctrl".into())
            .spawn(move || control::run(control_ctx))
            .map_err(|e| HitonyError::Other(anyhow::anyhow!("spawn main-ctrl: {e}")))?;

        let mut workers = self.workers.lock();
        workers.push(audio_worker);
        workers.push(control_worker);

        info!(device_id = %self.identity.device_id, "engine started");
        Ok(())
    }

    /// Stop both workers and join them.
    ///
    /// # Errors
    /// - `HitonyError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(HitonyError::NotRunning);
        }
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        info!("engine stopped");
        Ok(())
    }

    /// Touch-sourced wake: honoured in every session state, bypassing the
    /// acoustic gating.
    pub fn touch_wake(&self) {
        self.events.set(flags::TOUCH_WAKE);
    }

    /// Subscribe to the UI/status event bus.
    pub fn subscribe_events(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_tx.subscribe()
    }

    /// Session controller for the firmware-update collaborator.
    pub fn session_control(&self) -> Arc<SessionControl> {
        Arc::clone(&self.session)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn pipeline_diagnostics(&self) -> pipeline::DiagnosticsSnapshot {
        self.pipeline_diagnostics.snapshot()
    }

    pub fn control_diagnostics(&self) -> &ControlDiagnostics {
        &self.control_diagnostics
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pools.stats()
    }
}
