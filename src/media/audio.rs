//! Mikrofon-Zugriff über cpal
//!
//! Öffnet das Standard-Eingabegerät und hält den Stream offen, solange der
//! lokale Audio-Track lebt. Das Betriebssystem fragt dabei die Berechtigung
//! ab und zeigt das Mikrofon als aktiv an. Samples werden nicht verarbeitet.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, SupportedStreamConfig, SupportedStreamConfigRange};
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Bevorzugte Sample Rate (48kHz, passend zu Opus)
pub const SAMPLE_RATE: u32 = 48000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// AUDIO INPUT
// ============================================================================

/// Geöffnetes Mikrofon. Drop schließt den cpal Stream.
pub struct AudioInput {
    _stream: Stream,
}

// cpal::Stream ist nicht Send. Der Stream wird nur gehalten und beim Drop
// freigegeben, nie von mehreren Threads gleichzeitig benutzt.
unsafe impl Send for AudioInput {}

impl AudioInput {
    /// Öffnet das Standard-Mikrofon. Blockiert, bis das Gerät bereit ist.
    pub fn open() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;

        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let config = select_best_config(configs.collect())?;
        tracing::info!(
            "Opening audio input: {} Hz, {} channels, {:?}",
            config.sample_rate().0,
            config.channels(),
            config.sample_format()
        );

        let stream = device
            .build_input_stream_raw(
                &config.config(),
                config.sample_format(),
                |_: &cpal::Data, _: &cpal::InputCallbackInfo| {},
                |err| {
                    tracing::error!("Audio input error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Self { _stream: stream })
    }
}

impl Drop for AudioInput {
    fn drop(&mut self) {
        tracing::info!("Audio input closed");
    }
}

/// Priorität: 48kHz F32 > 48kHz beliebig > andere F32 > erste verfügbare
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<SupportedStreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let supports_target = |c: &SupportedStreamConfigRange| {
        c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate
    };

    if let Some(config) = configs
        .iter()
        .find(|c| supports_target(c) && c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.clone().with_sample_rate(target_rate));
    }

    if let Some(config) = configs.iter().find(|c| supports_target(c)) {
        return Ok(config.clone().with_sample_rate(target_rate));
    }

    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        return Ok(config.clone().with_max_sample_rate());
    }

    configs
        .first()
        .map(|c| c.clone().with_max_sample_rate())
        .ok_or_else(|| {
            AudioError::UnsupportedConfig("No suitable audio configuration found".to_string())
        })
}
