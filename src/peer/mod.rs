//! Peer Module - ICE/SDP Transport hinter einem schmalen Trait
//!
//! Der Koordinator sieht nur [`PeerConnection`] und [`PeerConnector`]:
//! - Offer/Answer erzeugen (setzt jeweils auch die Local Description)
//! - Remote Description und Remote Candidates anwenden
//! - Events: lokale Candidates, Verbindungsstatus, Remote Tracks
//!
//! [`WebRtcConnector`] ist die Implementierung über das `webrtc` Crate.

mod webrtc;

pub use self::webrtc::{WebRtcConnector, WebRtcPeer};

use crate::media::{MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Peer connection is closed")]
    Closed,
}

// ============================================================================
// STATE & EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// `Disconnected` und `Failed` beenden einen Anruf gleichermaßen.
    /// `Closed` entsteht nur durch lokales Schließen.
    pub fn is_failure(&self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Vom Peer empfangener Track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Neuer lokaler Candidate, muss zum Remote-Peer signalisiert werden
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
    RemoteTrack(RemoteTrack),
}

// ============================================================================
// TRAITS
// ============================================================================

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), TransportError>;

    /// Erzeugt ein Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Erzeugt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn has_remote_description(&self) -> bool;

    fn connection_state(&self) -> PeerState;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Eine frische Verbindung plus ihr Event-Stream
pub struct PeerLink {
    pub connection: Arc<dyn PeerConnection>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("state", &self.connection.connection_state())
            .finish()
    }
}

#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    /// Baut eine neue Verbindung für eine Session auf
    async fn connect(&self, session_id: &str) -> Result<PeerLink, TransportError>;
}
