//! HiTony daemon entry point.
//!
//! Wires the core engine to the host collaborators: the WebSocket transport,
//! the codec backend, the stand-in audio device, and a log surface playing
//! the role of the status LED and display.

mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use hitony_core::afe::{AfeConfig, EnergyBurstWake};
use hitony_core::codec::{AudioDecoder, AudioEncoder};
use hitony_core::config::ControlConfig;
use hitony_core::pipeline::io::SilenceAudio;
use hitony_core::{EngineConfig, SessionPhase, UiEvent, VoiceEngine};

use settings::{default_settings_path, load_settings};

fn led_pattern(phase: SessionPhase) -> &'static str {
    match phase {
        SessionPhase::Idle => "breathing-green",
        SessionPhase::Recording => "solid-red",
        SessionPhase::Thinking => "pulsing-blue",
        SessionPhase::Speaking => "solid-blue",
        SessionPhase::Music => "rainbow",
        SessionPhase::Error => "blinking-red",
    }
}

fn build_codecs() -> anyhow::Result<(Box<dyn AudioEncoder>, Box<dyn AudioDecoder>)> {
    #[cfg(feature = "opus")]
    {
        let encoder = hitony_core::codec::OpusEncoder::new().context("opus encoder")?;
        let decoder = hitony_core::codec::OpusDecoder::new().context("opus decoder")?;
        info!("using opus codec backend");
        Ok((Box::new(encoder), Box::new(decoder)))
    }
    #[cfg(not(feature = "opus"))]
    {
        use hitony_core::codec::pcm::PcmCodec;
        use hitony_core::config::{DECODER_FRAME_SAMPLES, ENCODER_FRAME_SAMPLES};
        warn!("built without the opus feature, using PCM16 pass-through");
        Ok((
            Box::new(PcmCodec::new(ENCODER_FRAME_SAMPLES)),
            Box::new(PcmCodec::new(DECODER_FRAME_SAMPLES)),
        ))
    }
}

fn main() -> anyhow::Result<()> {
    let settings_path = default_settings_path();
    let app_settings = load_settings(&settings_path);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| app_settings.log_filter.parse().expect("valid log filter")),
        )
        .init();

    info!(
        settings_path = %settings_path.display(),
        server_url = %app_settings.server_url,
        wake_phrase = %app_settings.wake_phrase,
        "hitony starting"
    );

    let mac = app_settings.resolve_mac();
    let config = EngineConfig {
        control: ControlConfig {
            wake_phrase: app_settings.wake_phrase.clone(),
            auto_listen: app_settings.auto_listen,
            ..ControlConfig::default()
        },
        afe: AfeConfig {
            enable_aec: app_settings.enable_aec,
            vad_sensitivity: app_settings.vad_sensitivity,
            ..AfeConfig::default()
        },
        mac,
        ..EngineConfig::default()
    };

    let engine = Arc::new(VoiceEngine::new(config));
    info!(device_id = %engine.identity().device_id, "device identity derived");

    let (encoder, decoder) = build_codecs()?;

    #[cfg(feature = "ws")]
    let factory = Box::new(hitony_core::transport::WsTransportFactory::new(
        app_settings.server_url.clone(),
        engine.identity().clone(),
    ));
    #[cfg(not(feature = "ws"))]
    anyhow::bail!("built without a transport backend (enable the `ws` feature)");

    #[cfg(feature = "ws")]
    {
        engine
            .start(
                Box::new(SilenceAudio::new()),
                factory,
                encoder,
                decoder,
                Box::new(EnergyBurstWake::default()),
            )
            .context("engine start")?;

        // Status surface: what the LED and display would show.
        let mut events = engine.subscribe_events();
        loop {
            match events.try_recv() {
                Ok(UiEvent::Phase { phase }) => {
                    info!(?phase, led = led_pattern(phase), "phase");
                }
                Ok(UiEvent::Status { text }) => info!(status = %text, "status"),
                Ok(UiEvent::AsrText { text }) => info!(asr = %text, "recognised"),
                Ok(UiEvent::Expression { expr, duration_ms }) => {
                    info!(expr = %expr, duration_ms, "expression");
                }
                Ok(UiEvent::MusicTitle { title }) => {
                    info!(title = title.as_deref().unwrap_or("-"), "music title");
                }
                Ok(UiEvent::PlaybackEnergy { .. }) => {}
                Ok(UiEvent::ReconnectCountdown { seconds }) => {
                    info!(seconds, "reconnecting");
                }
                Ok(UiEvent::OtaAvailable { version, url }) => {
                    warn!(version = %version, url = %url, "firmware update available");
                }
                Err(tokio::sync::broadcast::error::TryRecvError::Empty) => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(lagged = n, "event subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::TryRecvError::Closed) => break,
            }
        }

        engine.stop().ok();
    }

    Ok(())
}
