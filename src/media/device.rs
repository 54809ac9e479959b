//! Echte Eingabegeräte (Feature `device-audio`)

use super::audio::AudioInput;
use super::{MediaAccessError, MediaDevices, MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use uuid::Uuid;

/// Mikrofon über cpal. Kamera-Capture wird nicht unterstützt.
///
/// Prüft Berechtigung und Verfügbarkeit und hält das Gerät offen, solange der
/// Track lebt. Die Medien selbst liefert der Peer-Transport.
#[derive(Debug, Default, Clone)]
pub struct DeviceMediaDevices;

impl DeviceMediaDevices {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaDevices for DeviceMediaDevices {
    async fn acquire(&self, audio: bool, video: bool) -> Result<MediaStream, MediaAccessError> {
        if !audio && !video {
            return Err(MediaAccessError::NothingRequested);
        }
        if video {
            return Err(MediaAccessError::DeviceUnavailable("camera".to_string()));
        }

        let stream_id = Uuid::new_v4().to_string();
        let track = MediaTrack::new(format!("{}-audio", stream_id), TrackKind::Audio);

        // cpal blockiert beim Öffnen des Geräts
        let input = tokio::task::spawn_blocking(AudioInput::open)
            .await
            .map_err(|e| MediaAccessError::DeviceUnavailable(e.to_string()))?
            .map_err(|e| MediaAccessError::DeviceUnavailable(e.to_string()))?;

        Ok(MediaStream::with_capture(stream_id, vec![track], Box::new(input)))
    }
}
