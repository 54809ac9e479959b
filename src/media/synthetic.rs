//! Geräte ohne Hardware
//!
//! Liefert Tracks ohne echte Capture. Die Freigabe-Entscheidung ist
//! konfigurierbar, damit Permission-Fehler reproduzierbar sind.

use super::{MediaAccessError, MediaDevices, MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

struct SyntheticState {
    granted: bool,
    video_available: bool,
    issued: Vec<MediaTrack>,
}

#[derive(Clone)]
pub struct SyntheticMediaDevices {
    state: Arc<Mutex<SyntheticState>>,
}

impl SyntheticMediaDevices {
    /// Erteilt jede Anfrage
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SyntheticState {
                granted: true,
                video_available: true,
                issued: Vec::new(),
            })),
        }
    }

    /// Verweigert jede Anfrage mit `PermissionDenied`
    pub fn denying() -> Self {
        let devices = Self::new();
        devices.set_permission(false);
        devices
    }

    pub fn set_permission(&self, granted: bool) {
        self.state.lock().granted = granted;
    }

    /// Simuliert eine fehlende Kamera
    pub fn set_video_available(&self, available: bool) {
        self.state.lock().video_available = available;
    }

    /// Alle jemals ausgegebenen Tracks
    pub fn issued_tracks(&self) -> Vec<MediaTrack> {
        self.state.lock().issued.clone()
    }

    /// Ausgegebene Tracks, die noch nicht gestoppt wurden
    pub fn live_track_count(&self) -> usize {
        self.state
            .lock()
            .issued
            .iter()
            .filter(|t| t.is_live())
            .count()
    }
}

impl Default for SyntheticMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticMediaDevices {
    async fn acquire(&self, audio: bool, video: bool) -> Result<MediaStream, MediaAccessError> {
        if !audio && !video {
            return Err(MediaAccessError::NothingRequested);
        }

        let mut state = self.state.lock();
        if !state.granted {
            return Err(MediaAccessError::PermissionDenied);
        }
        if video && !state.video_available {
            return Err(MediaAccessError::DeviceUnavailable("camera".to_string()));
        }

        let stream_id = Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        if audio {
            tracks.push(MediaTrack::new(format!("{}-audio", stream_id), TrackKind::Audio));
        }
        if video {
            tracks.push(MediaTrack::new(format!("{}-video", stream_id), TrackKind::Video));
        }
        state.issued.extend(tracks.iter().cloned());

        Ok(MediaStream::new(stream_id, tracks))
    }
}

impl std::fmt::Debug for SyntheticMediaDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SyntheticMediaDevices")
            .field("granted", &state.granted)
            .field("video_available", &state.video_available)
            .field("issued", &state.issued.len())
            .finish()
    }
}
