//! WebRTC Peer Connection
//!
//! Verwaltet `RTCPeerConnection`s und übersetzt deren Callbacks in
//! [`PeerEvent`]s. Audio-Tracks sind Opus, Video-Tracks VP8.

use super::{PeerConnection, PeerConnector, PeerEvent, PeerLink, PeerState, RemoteTrack, TransportError};
use crate::config::{CallConfig, IceServerConfig};
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use ::webrtc::api::APIBuilder;
use ::webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use ::webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use ::webrtc::track::track_local::TrackLocal;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opus läuft immer mit 48kHz
const OPUS_CLOCK_RATE: u32 = 48000;
const VIDEO_CLOCK_RATE: u32 = 90000;

fn webrtc_err(e: ::webrtc::Error) -> TransportError {
    TransportError::WebRtc(e.to_string())
}

fn to_rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone(),
            credential: s.credential.clone(),
            ..Default::default()
        })
        .collect()
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

// ============================================================================
// CONNECTOR
// ============================================================================

/// Erzeugt pro Session eine neue `RTCPeerConnection`
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<IceServerConfig>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &CallConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(&self.ice_servers),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(webrtc_err)?;
        Ok(Arc::new(pc))
    }
}

impl Default for WebRtcConnector {
    fn default() -> Self {
        Self::from_config(&CallConfig::default())
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, session_id: &str) -> Result<PeerLink, TransportError> {
        let pc = self.create_peer_connection().await?;
        let (event_tx, events) = mpsc::unbounded_channel();
        let peer = WebRtcPeer::new(session_id, pc, event_tx);

        Ok(PeerLink {
            connection: Arc::new(peer),
            events,
        })
    }
}

// ============================================================================
// PEER
// ============================================================================

pub struct WebRtcPeer {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    state: Arc<Mutex<PeerState>>,
    /// Lokale RTP-Tracks, gehalten solange die Verbindung lebt
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticRTP>>>,
}

impl WebRtcPeer {
    fn new(
        session_id: &str,
        pc: Arc<RTCPeerConnection>,
        event_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let peer = Self {
            session_id: session_id.to_string(),
            pc,
            state: Arc::new(Mutex::new(PeerState::New)),
            local_tracks: Mutex::new(Vec::new()),
        };
        peer.setup_handlers(event_tx);
        peer
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(&self, event_tx: mpsc::UnboundedSender<PeerEvent>) {
        // Connection State Handler
        let state = Arc::clone(&self.state);
        let tx = event_tx.clone();
        let session_id = self.session_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let new_state = map_state(s);
                tracing::info!("Peer connection state for {}: {}", session_id, new_state);
                *state.lock() = new_state;
                let _ = tx.send(PeerEvent::StateChanged(new_state));
                Box::pin(async {})
            }));

        // ICE Candidate Handler (trickle)
        let tx = event_tx.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Track Handler
        let tx = event_tx;
        self.pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            tracing::info!("Received remote {} track: {:?}", kind, track.codec());
            let _ = tx.send(PeerEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                kind,
            }));
            Box::pin(async {})
        }));
    }

    fn rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        let result = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        };
        result.map_err(|e| TransportError::InvalidSdp(e.to_string()))
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if *self.state.lock() == PeerState::Closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        self.ensure_open()?;

        let capability = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };

        let rtp_track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            track.id().to_string(),
            format!("pulse-{}", self.session_id),
        ));

        self.pc
            .add_track(Arc::clone(&rtp_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;
        self.local_tracks.lock().push(rtp_track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        let rtc_desc = Self::rtc_description(desc)?;
        self.pc
            .set_remote_description(rtc_desc)
            .await
            .map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn connection_state(&self) -> PeerState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if *state == PeerState::Closed {
                return Ok(());
            }
            *state = PeerState::Closed;
        }
        self.local_tracks.lock().clear();
        self.pc.close().await.map_err(webrtc_err)
    }
}

impl std::fmt::Debug for WebRtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcPeer")
            .field("session_id", &self.session_id)
            .field("state", &self.connection_state())
            .field("local_tracks", &self.local_tracks.lock().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> WebRtcConnector {
        // Ohne STUN, damit Tests keine Netzwerk-Lookups machen
        WebRtcConnector::new(Vec::new())
    }

    #[tokio::test]
    async fn test_offer_contains_audio_section() {
        let link = connector().connect("c1").await.unwrap();
        let pc = link.connection;

        pc.add_local_track(&MediaTrack::new("mic", TrackKind::Audio))
            .await
            .unwrap();
        let offer = pc.create_offer().await.unwrap();

        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(!pc.has_remote_description().await);

        pc.close().await.unwrap();
        assert_eq!(pc.connection_state(), PeerState::Closed);
    }

    #[tokio::test]
    async fn test_offer_answer_exchange_sets_remote_descriptions() {
        let caller = connector().connect("c1").await.unwrap().connection;
        let callee = connector().connect("c1").await.unwrap().connection;

        caller
            .add_local_track(&MediaTrack::new("mic-a", TrackKind::Audio))
            .await
            .unwrap();
        let offer = caller.create_offer().await.unwrap();

        callee.set_remote_description(&offer).await.unwrap();
        callee
            .add_local_track(&MediaTrack::new("mic-b", TrackKind::Audio))
            .await
            .unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);

        caller.set_remote_description(&answer).await.unwrap();
        assert!(caller.has_remote_description().await);
        assert!(callee.has_remote_description().await);

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_peer_rejects_operations() {
        let pc = connector().connect("c1").await.unwrap().connection;
        pc.close().await.unwrap();
        assert_eq!(pc.create_offer().await.unwrap_err(), TransportError::Closed);
    }

    #[test]
    fn test_ice_server_mapping() {
        let servers = to_rtc_ice_servers(&crate::config::default_ice_servers());
        assert_eq!(servers.len(), 1);
        assert!(servers[0].urls[0].starts_with("stun:"));
    }
}
