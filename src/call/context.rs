//! Ressourcen eines laufenden Anrufs

use super::state::CallDirection;
use crate::media::{MediaStream, TrackKind};
use crate::peer::{PeerConnection, RemoteTrack};
use crate::signaling::MediaKind;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Genau ein Kontext pro Koordinator. Drop gibt alles frei.
pub(crate) struct CallContext {
    /// Unterscheidet diesen Anruf von späteren, damit verspätete Tasks nichts anfassen
    pub generation: u64,
    pub session_id: String,
    pub peer_id: String,
    pub direction: CallDirection,
    pub media_kind: MediaKind,
    pub created_at: i64,
    pub connected_at: Option<i64>,
    pub local_stream: Option<MediaStream>,
    pub remote_tracks: Vec<RemoteTrack>,
    pub peer: Option<Arc<dyn PeerConnection>>,
    /// Session-Dokument existiert im Store
    pub session_written: bool,
    pub muted: bool,
    pub video_enabled: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl CallContext {
    pub fn new(
        session_id: String,
        peer_id: String,
        direction: CallDirection,
        media_kind: MediaKind,
        created_at: i64,
    ) -> Self {
        Self {
            generation: 0,
            session_id,
            peer_id,
            direction,
            media_kind,
            created_at,
            connected_at: None,
            local_stream: None,
            remote_tracks: Vec::new(),
            peer: None,
            session_written: false,
            muted: false,
            video_enabled: media_kind.wants_video(),
            tasks: Vec::new(),
        }
    }

    pub fn push_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        if let Some(stream) = &self.local_stream {
            stream.set_enabled(kind, enabled);
        }
    }

    pub fn live_local_tracks(&self) -> usize {
        self.local_stream
            .as_ref()
            .map(|s| s.live_track_count())
            .unwrap_or(0)
    }

    /// Bricht alle Tasks ab, stoppt die Tracks und gibt die Peer Connection
    /// zum Schließen zurück
    pub fn release(&mut self) -> Option<Arc<dyn PeerConnection>> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut stream) = self.local_stream.take() {
            stream.stop_all();
        }
        self.remote_tracks.clear();
        self.peer.take()
    }
}

impl Drop for CallContext {
    fn drop(&mut self) {
        if let Some(peer) = self.release() {
            // Nur erreichbar, wenn der Kontext ohne Teardown verworfen wird
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = peer.close().await;
                });
            }
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("generation", &self.generation)
            .field("session_id", &self.session_id)
            .field("peer_id", &self.peer_id)
            .field("direction", &self.direction)
            .field("local_tracks", &self.live_local_tracks())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}
