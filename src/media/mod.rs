//! Media Module - lokale Audio/Video Capture-Handles
//!
//! Der Call-Kern behandelt Geräte als Capability: [`MediaDevices::acquire`]
//! liefert einen [`MediaStream`] oder scheitert mit [`MediaAccessError`].
//! - [`SyntheticMediaDevices`]: Geräte ohne Hardware (Tests, Headless)
//! - `DeviceMediaDevices` (Feature `device-audio`): Mikrofon über cpal

#[cfg(feature = "device-audio")]
mod audio;
#[cfg(feature = "device-audio")]
mod device;
mod synthetic;

#[cfg(feature = "device-audio")]
pub use audio::{AudioError, AudioInput, SAMPLE_RATE};
#[cfg(feature = "device-audio")]
pub use device::DeviceMediaDevices;
pub use synthetic::SyntheticMediaDevices;

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("Permission to access media devices was denied")]
    PermissionDenied,

    #[error("Media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Neither audio nor video was requested")]
    NothingRequested,
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle auf einen lokalen Track. Klone teilen denselben Zustand.
#[derive(Clone)]
pub struct MediaTrack {
    id: Arc<str>,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        let id: String = id.into();
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Deaktivierte Tracks bleiben verbunden, liefern aber Stille/Schwarzbild
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stoppt den Track endgültig
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            tracing::debug!("Stopped {} track {}", self.kind, self.id);
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// STREAM
// ============================================================================

/// Lokaler Media Stream. Drop stoppt alle Tracks.
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
    /// Hält das geöffnete Gerät am Leben (z.B. cpal Stream)
    capture: Option<std::sync::Mutex<Box<dyn Send>>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
            capture: None,
        }
    }

    /// Stream, dessen Capture-Ressource beim Stoppen freigegeben wird
    pub fn with_capture(
        id: impl Into<String>,
        tracks: Vec<MediaTrack>,
        capture: Box<dyn Send>,
    ) -> Self {
        Self {
            id: id.into(),
            tracks,
            capture: Some(std::sync::Mutex::new(capture)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn stop_all(&mut self) {
        for track in &self.tracks {
            track.stop();
        }
        self.capture = None;
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .field("capture", &self.capture.is_some())
            .finish()
    }
}

// ============================================================================
// DEVICES
// ============================================================================

#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    /// Fordert Capture-Handles an. Wartet ggf. auf die Freigabe durch den Nutzer.
    async fn acquire(&self, audio: bool, video: bool) -> Result<MediaStream, MediaAccessError>;
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_clones_share_state() {
        let track = MediaTrack::new("mic", TrackKind::Audio);
        let handle = track.clone();

        handle.set_enabled(false);
        assert!(!track.is_enabled());

        handle.stop();
        assert!(!track.is_live());
    }

    #[test]
    fn test_dropping_stream_stops_tracks() {
        let audio = MediaTrack::new("mic", TrackKind::Audio);
        let video = MediaTrack::new("cam", TrackKind::Video);
        let stream = MediaStream::new("s1", vec![audio.clone(), video.clone()]);
        assert_eq!(stream.live_track_count(), 2);

        drop(stream);
        assert!(!audio.is_live());
        assert!(!video.is_live());
    }

    #[test]
    fn test_set_enabled_by_kind() {
        let stream = MediaStream::new(
            "s1",
            vec![
                MediaTrack::new("mic", TrackKind::Audio),
                MediaTrack::new("cam", TrackKind::Video),
            ],
        );

        stream.set_enabled(TrackKind::Video, false);
        assert!(stream.tracks_of(TrackKind::Audio).all(|t| t.is_enabled()));
        assert!(stream.tracks_of(TrackKind::Video).all(|t| !t.is_enabled()));
    }
}
