//! Shared harness for the end-to-end scenario tests: a scripted server
//! behind the transport seam, a scripted audio device, and a wake detector
//! that fires on demand.

// Each test binary uses a different subset of the harness.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hitony_core::afe::{AfeConfig, WakeDetector};
use hitony_core::codec::pcm::PcmCodec;
use hitony_core::config::{ControlConfig, PipelineConfig};
use hitony_core::error::{HitonyError, Result};
use hitony_core::ipc::events::{SessionPhase, UiEvent};
use hitony_core::pipeline::io::AudioIo;
use hitony_core::protocol::encode_batch;
use hitony_core::transport::sink::TransportSink;
use hitony_core::transport::{Opcode, Transport, TransportFactory};
use hitony_core::{EngineConfig, VoiceEngine};

// ---------------------------------------------------------------------------
// Scripted transport / server
// ---------------------------------------------------------------------------

pub struct ServerInner {
    sink: Option<TransportSink>,
    connected: Option<Arc<AtomicBool>>,
    pub sent_json: Vec<serde_json::Value>,
    pub sent_binary: Vec<Vec<u8>>,
    pub connect_times: Vec<Instant>,
    /// Upcoming connect attempts that must fail.
    pub fail_connects: u32,
}

#[derive(Clone)]
pub struct ServerHandle(Arc<Mutex<ServerInner>>);

impl ServerHandle {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(ServerInner {
            sink: None,
            connected: None,
            sent_json: Vec::new(),
            sent_binary: Vec::new(),
            connect_times: Vec::new(),
            fail_connects: 0,
        })))
    }

    pub fn factory(&self) -> Box<dyn TransportFactory> {
        Box::new(FakeFactory(self.0.clone()))
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.0.lock().unwrap().fail_connects = n;
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.0.lock().unwrap().connect_times.clone()
    }

    pub fn send_text(&self, json: &str) {
        let mut inner = self.0.lock().unwrap();
        if let Some(sink) = inner.sink.as_mut() {
            sink.on_frame(Opcode::Text, json.as_bytes());
        }
    }

    pub fn send_batch(&self, packets: &[Vec<u8>]) {
        let batch = encode_batch(packets.iter().map(|p| p.as_slice()));
        let mut inner = self.0.lock().unwrap();
        if let Some(sink) = inner.sink.as_mut() {
            sink.on_frame(Opcode::Binary, &batch);
        }
    }

    pub fn reply_hello(&self) {
        self.send_text(r#"{"type":"hello","session_id":"test-session","features":{"abort":true}}"#);
    }

    /// Kill the connection from the server side.
    pub fn disconnect(&self) {
        let mut inner = self.0.lock().unwrap();
        if let Some(connected) = inner.connected.take() {
            connected.store(false, Ordering::SeqCst);
        }
        if let Some(mut sink) = inner.sink.take() {
            sink.on_disconnected();
        }
    }

    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.0.lock().unwrap().sent_json.clone()
    }

    pub fn sent_binary_count(&self) -> usize {
        self.0.lock().unwrap().sent_binary.len()
    }

    pub fn count_of_type(&self, msg_type: &str) -> usize {
        self.sent_json()
            .iter()
            .filter(|m| m["type"] == msg_type)
            .count()
    }

    pub fn wait_for_message<F>(&self, timeout: Duration, pred: F) -> serde_json::Value
    where
        F: Fn(&serde_json::Value) -> bool,
    {
        let start = Instant::now();
        loop {
            if let Some(found) = self.sent_json().iter().find(|m| pred(m)) {
                return found.clone();
            }
            if start.elapsed() >= timeout {
                panic!(
                    "timed out waiting for client message; got {:?}",
                    self.sent_json()
                );
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn wait_for_type(&self, msg_type: &str, timeout: Duration) -> serde_json::Value {
        self.wait_for_message(timeout, |m| m["type"] == msg_type)
    }
}

struct FakeFactory(Arc<Mutex<ServerInner>>);

impl TransportFactory for FakeFactory {
    fn connect(&mut self, mut sink: TransportSink) -> Result<Box<dyn Transport>> {
        let mut inner = self.0.lock().unwrap();
        inner.connect_times.push(Instant::now());
        if inner.fail_connects > 0 {
            inner.fail_connects -= 1;
            return Err(HitonyError::Transport("scripted connect failure".into()));
        }
        sink.on_connected();
        let connected = Arc::new(AtomicBool::new(true));
        inner.sink = Some(sink);
        inner.connected = Some(Arc::clone(&connected));
        Ok(Box::new(FakeTransport {
            inner: self.0.clone(),
            connected,
        }))
    }
}

struct FakeTransport {
    inner: Arc<Mutex<ServerInner>>,
    connected: Arc<AtomicBool>,
}

impl Transport for FakeTransport {
    fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(HitonyError::NotConnected);
        }
        let value = serde_json::from_str(text)
            .map_err(|e| HitonyError::Transport(format!("client sent invalid json: {e}")))?;
        self.inner.lock().unwrap().sent_json.push(value);
        Ok(())
    }

    fn send_binary(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(HitonyError::NotConnected);
        }
        self.inner.lock().unwrap().sent_binary.push(data.to_vec());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let mut inner = self.inner.lock().unwrap();
            if let Some(mut sink) = inner.sink.take() {
                sink.on_disconnected();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted audio device
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AudioHandle {
    feed: Arc<Mutex<VecDeque<Vec<i16>>>>,
    played: Arc<Mutex<Vec<i16>>>,
}

impl AudioHandle {
    /// Queue `frames` stereo capture frames of constant amplitude.
    pub fn push_frames(&self, amplitude: i16, frames: usize, mono_samples: usize) {
        let mut feed = self.feed.lock().unwrap();
        for _ in 0..frames {
            feed.push_back(vec![amplitude; mono_samples * 2]);
        }
    }

    pub fn played(&self) -> Vec<i16> {
        self.played.lock().unwrap().clone()
    }
}

pub struct ScriptedAudio {
    handle: AudioHandle,
}

impl ScriptedAudio {
    pub fn new() -> (Self, AudioHandle) {
        let handle = AudioHandle {
            feed: Arc::new(Mutex::new(VecDeque::new())),
            played: Arc::new(Mutex::new(Vec::new())),
        };
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl AudioIo for ScriptedAudio {
    fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize> {
        // Faster than real time, but still paced so wall-clock windows make
        // sense.
        std::thread::sleep(Duration::from_millis(1));
        match self.handle.feed.lock().unwrap().pop_front() {
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
        self.handle.played.lock().unwrap().extend_from_slice(pcm);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// On-demand wake detector
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WakeTrigger(Arc<AtomicBool>);

impl WakeTrigger {
    pub fn fire(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct TriggeredWake(Arc<AtomicBool>);

impl TriggeredWake {
    pub fn new() -> (Self, WakeTrigger) {
        let flag = Arc::new(AtomicBool::new(false));
        (Self(Arc::clone(&flag)), WakeTrigger(flag))
    }
}

impl WakeDetector for TriggeredWake {
    fn process(&mut self, _frame: &[i16]) -> Option<usize> {
        self.0.swap(false, Ordering::SeqCst).then_some(0)
    }

    fn reset(&mut self) {}
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

pub const MONO_FRAME: usize = 64;

pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        pipeline: PipelineConfig {
            capture_frame_samples: MONO_FRAME,
            afe_chunk_samples: MONO_FRAME,
            silence_window: Duration::from_millis(80),
            short_utterance: Duration::from_millis(50),
            max_recording: Duration::from_millis(800),
            thinking_timeout: Duration::from_secs(2),
            aec_convergence: Duration::from_millis(30),
            playback_wait: Duration::from_millis(5),
            stats_interval: Duration::from_secs(30),
            ..PipelineConfig::default()
        },
        control: ControlConfig {
            tick: Duration::from_millis(5),
            drain_observations: 6,
            recording_cap: Duration::from_millis(1200),
            thinking_timeout: Duration::from_millis(600),
            speaking_timeout: Duration::from_millis(400),
            stall_warnings: [Duration::from_millis(100), Duration::from_millis(200)],
            backoff_base: Duration::from_millis(120),
            backoff_max: Duration::from_millis(960),
            music_flag_timeout: Duration::from_secs(2),
            playback_enqueue_wait: Duration::from_millis(10),
            heartbeat_interval: Duration::from_secs(30),
            ..ControlConfig::default()
        },
        afe: AfeConfig {
            mic_channels: 2,
            chunk_samples: MONO_FRAME,
            enable_aec: false,
            enable_ns: false,
            enable_agc: false,
            ..AfeConfig::default()
        },
        mac: [0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03],
    }
}

pub struct Harness {
    pub engine: Arc<VoiceEngine>,
    pub server: ServerHandle,
    pub audio: AudioHandle,
    pub wake: WakeTrigger,
    pub events: tokio::sync::broadcast::Receiver<UiEvent>,
}

impl Harness {
    pub fn start() -> Self {
        Self::start_with_config(test_engine_config())
    }

    pub fn start_with_config(config: EngineConfig) -> Self {
        let engine = Arc::new(VoiceEngine::new(config));
        let server = ServerHandle::new();
        let (audio, audio_handle) = ScriptedAudio::new();
        let (wake_detector, wake) = TriggeredWake::new();
        let events = engine.subscribe_events();

        engine
            .start(
                Box::new(audio),
                server.factory(),
                Box::new(PcmCodec::new(MONO_FRAME)),
                Box::new(PcmCodec::new(960)),
                Box::new(wake_detector),
            )
            .expect("engine start");

        Self {
            engine,
            server,
            audio: audio_handle,
            wake,
            events,
        }
    }

    /// Complete the handshake and return once the client is usable.
    pub fn handshake(&mut self) {
        self.server
            .wait_for_type("hello", Duration::from_secs(2));
        self.server.reply_hello();
        // The hello reply gates wake intake; give the control tick a beat.
        std::thread::sleep(Duration::from_millis(30));
    }

    pub fn wait_for_phase(&mut self, phase: SessionPhase, timeout: Duration) {
        let start = Instant::now();
        loop {
            match self.events.try_recv() {
                Ok(UiEvent::Phase { phase: got }) if got == phase => return,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        panic!("timed out waiting for phase {phase:?}");
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::TryRecvError::Closed) => {
                    panic!("event bus closed while waiting for {phase:?}")
                }
            }
        }
    }

    /// PCM packet whose decoded samples all carry `seq`, for order checks.
    pub fn seq_packet(seq: i16, samples: usize) -> Vec<u8> {
        std::iter::repeat(seq)
            .take(samples)
            .flat_map(i16::to_le_bytes)
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.engine.stop();
    }
}
