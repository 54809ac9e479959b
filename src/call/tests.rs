//! Szenarien für den CallCoordinator
//!
//! Zwei Koordinatoren (alice, bob) teilen sich einen In-Memory Store.
//! Die Peer Connection ist ein Fake, damit kein ICE/DTLS läuft.

use super::coordinator::now_ms;
use super::*;
use crate::database::CallDatabase;
use crate::identity::{Identity, IdentityProvider};
use crate::media::{MediaAccessError, MediaTrack, SyntheticMediaDevices, TrackKind};
use crate::peer::{PeerConnection, PeerConnector, PeerEvent, PeerLink, PeerState, TransportError};
use crate::signaling::{
    CallSession, CallStatus, DocPath, DocumentSnapshot, DocumentStore, IceCandidate, IceCandidateRecord,
    MediaKind, MemoryStore, Query, SessionDescription, SignalingChannel, StoreError, Subscription,
    CALLS_COLLECTION,
};
use crate::config::CallConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

// ============================================================================
// FAKE PEER
// ============================================================================

struct FakePeer {
    state: Mutex<PeerState>,
    remote: AtomicBool,
    remote_sets: AtomicUsize,
    applied: Mutex<Vec<IceCandidate>>,
    tracks: Mutex<Vec<MediaTrack>>,
    closes: AtomicUsize,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl FakePeer {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if *self.state.lock() == PeerState::Closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Simuliert einen Statuswechsel des Transports
    fn emit_state(&self, state: PeerState) {
        *self.state.lock() = state;
        let _ = self.events.send(PeerEvent::StateChanged(state));
    }

    fn applied(&self) -> usize {
        self.applied.lock().len()
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.tracks.lock().push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if !self.remote.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidSdp("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_remote_description(&self, _desc: &SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.remote.store(true, Ordering::SeqCst);
        self.remote_sets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !self.remote.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidCandidate("no remote description".to_string()));
        }
        self.applied.lock().push(candidate.clone());
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> PeerState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<(), TransportError> {
        *self.state.lock() = PeerState::Closed;
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakePeerConnector {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    fail_connect: AtomicBool,
}

impl FakePeerConnector {
    fn connects(&self) -> usize {
        self.peers.lock().len()
    }

    fn peer(&self, index: usize) -> Arc<FakePeer> {
        Arc::clone(&self.peers.lock()[index])
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn connect(&self, _session_id: &str) -> Result<PeerLink, TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::WebRtc("ice gathering failed".to_string()));
        }

        let (events, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(FakePeer {
            state: Mutex::new(PeerState::New),
            remote: AtomicBool::new(false),
            remote_sets: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            events,
        });
        self.peers.lock().push(Arc::clone(&peer));

        Ok(PeerLink {
            connection: peer,
            events: rx,
        })
    }
}

// ============================================================================
// FLAKY STORE
// ============================================================================

/// MemoryStore, dessen Merges sich abschalten lassen
#[derive(Default)]
struct FlakyStore {
    memory: MemoryStore,
    fail_merges: AtomicBool,
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        self.memory.get(path).await
    }
    async fn set(&self, path: &DocPath, data: Value) -> Result<(), StoreError> {
        self.memory.set(path, data).await
    }
    async fn merge(&self, path: &DocPath, patch: Value) -> Result<(), StoreError> {
        if self.fail_merges.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionFailed("connection reset".to_string()));
        }
        self.memory.merge(path, patch).await
    }
    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        self.memory.delete(path).await
    }
    async fn add(&self, collection: &str, data: Value) -> Result<String, StoreError> {
        self.memory.add(collection, data).await
    }
    async fn query(&self, query: &Query) -> Result<Vec<DocumentSnapshot>, StoreError> {
        self.memory.query(query).await
    }
    async fn watch_document(
        &self,
        path: &DocPath,
    ) -> Result<Subscription<Option<Value>>, StoreError> {
        self.memory.watch_document(path).await
    }
    async fn watch_query(
        &self,
        query: &Query,
    ) -> Result<Subscription<Vec<DocumentSnapshot>>, StoreError> {
        self.memory.watch_query(query).await
    }
}

// ============================================================================
// HARNESS
// ============================================================================

struct Side {
    coordinator: CallCoordinator,
    identity: IdentityProvider,
    media: SyntheticMediaDevices,
    peers: Arc<FakePeerConnector>,
}

impl Side {
    fn new(store: &Arc<FlakyStore>, user_id: &str, config: CallConfig) -> Self {
        Self::with_history(store, user_id, config, None)
    }

    fn with_history(
        store: &Arc<FlakyStore>,
        user_id: &str,
        config: CallConfig,
        history: Option<Arc<CallDatabase>>,
    ) -> Self {
        let identity = IdentityProvider::signed_in(Identity::new(user_id));
        let media = SyntheticMediaDevices::new();
        let peers = Arc::new(FakePeerConnector::default());

        let mut builder = CallCoordinator::builder(store.clone(), identity.clone())
            .config(config)
            .media(Arc::new(media.clone()))
            .connector(peers.clone());
        if let Some(db) = history {
            builder = builder.history(db);
        }
        let coordinator = builder.build();
        coordinator.start();

        Self {
            coordinator,
            identity,
            media,
            peers,
        }
    }
}

struct Harness {
    store: Arc<FlakyStore>,
    alice: Side,
    bob: Side,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(config_with_ring_timeout(5_000))
    }

    fn with_config(config: CallConfig) -> Self {
        let store = Arc::new(FlakyStore::default());
        let alice = Side::new(&store, "alice", config.clone());
        let bob = Side::new(&store, "bob", config);
        Self { store, alice, bob }
    }

    fn channel(&self) -> SignalingChannel {
        SignalingChannel::new(self.store.clone())
    }

    async fn session_status(&self, session_id: &str) -> CallStatus {
        self.channel()
            .get_session(session_id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    /// alice ruft bob an, bob nimmt an, beide sind verbunden
    async fn connected_call(&self) -> String {
        let id = self
            .alice
            .coordinator
            .initiate_call("bob", MediaKind::Audio)
            .await
            .unwrap();
        wait_for("incoming call at bob", || {
            self.bob.coordinator.pending_incoming().len() == 1
        })
        .await;

        self.bob.coordinator.answer_call(&id).await.unwrap();
        wait_for("caller connected", || self.alice.coordinator.phase().is_connected()).await;
        id
    }
}

fn config_with_ring_timeout(ring_timeout_ms: u64) -> CallConfig {
    CallConfig {
        ring_timeout_ms,
        ice_servers: Vec::new(),
        resubscribe_delay_ms: 50,
        ..CallConfig::default()
    }
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn candidate(n: usize) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000{} typ host", n, n, n),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

fn ended_with(phase: &CallPhase, expected: EndReason) -> bool {
    matches!(phase, CallPhase::Ended { reason, .. } if *reason == expected)
}

// ============================================================================
// HAPPY PATH
// ============================================================================

#[tokio::test]
async fn test_answered_call_connects_exactly_once() {
    let h = Harness::new();
    let mut caller_events = h.alice.coordinator.subscribe();

    let id = h.connected_call().await;
    assert!(h.bob.coordinator.phase().is_connected());
    assert_eq!(h.session_status(&id).await, CallStatus::Connected);

    // Derselbe Snapshot nochmal darf nichts doppelt anwenden
    h.store.memory.redeliver(&DocPath::new(CALLS_COLLECTION, id.as_str()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let caller_peer = h.alice.peers.peer(0);
    assert_eq!(caller_peer.remote_sets.load(Ordering::SeqCst), 1);
    let connected = drain(&mut caller_events)
        .into_iter()
        .filter(|e| matches!(e, CallEvent::StateChanged(CallPhase::Connected { .. })))
        .count();
    assert_eq!(connected, 1);

    let snapshot = h.alice.coordinator.snapshot();
    assert!(snapshot.in_call);
    assert_eq!(snapshot.local_track_count, 1);
    assert!(snapshot.duration_ms.is_some());
}

#[tokio::test]
async fn test_session_id_format() {
    let h = Harness::new();
    let id = h
        .alice
        .coordinator
        .initiate_call("bob", MediaKind::Video)
        .await
        .unwrap();

    let parts: Vec<&str> = id.split('_').collect();
    assert_eq!(parts.len(), 3);
    assert!(parts[0].parse::<i64>().is_ok());
    assert_eq!(parts[1], "alice");
    assert_eq!(parts[2].len(), 8);

    let session = h.channel().get_session(&id).await.unwrap().unwrap();
    assert_eq!(session.media_kind, MediaKind::Video);
    assert!(session.offer.is_some());
    assert_eq!(h.alice.peers.peer(0).tracks.lock().len(), 2);
}

#[tokio::test]
async fn test_end_call_is_idempotent() {
    let h = Harness::new();
    let id = h.connected_call().await;

    h.alice.coordinator.end_call().await;
    h.alice.coordinator.end_call().await;

    assert!(ended_with(&h.alice.coordinator.phase(), EndReason::LocalHangup));
    assert_eq!(h.alice.media.live_track_count(), 0);
    assert_eq!(h.alice.peers.peer(0).closes.load(Ordering::SeqCst), 1);

    let session = h.channel().get_session(&id).await.unwrap().unwrap();
    assert_eq!(session.status, CallStatus::Ended);
    assert!(session.ended_at.is_some());

    wait_for("remote hangup at bob", || {
        ended_with(&h.bob.coordinator.phase(), EndReason::RemoteHangup)
    })
    .await;
    assert_eq!(h.bob.media.live_track_count(), 0);
}

#[tokio::test]
async fn test_end_call_without_call_is_noop() {
    let h = Harness::new();
    h.alice.coordinator.end_call().await;
    assert_eq!(h.alice.coordinator.phase(), CallPhase::Idle);
}

// ============================================================================
// ICE CANDIDATES
// ============================================================================

#[tokio::test]
async fn test_only_remote_candidates_are_applied_after_answer() {
    let h = Harness::new();
    let channel = h.channel();
    let id = h
        .alice
        .coordinator
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();

    for n in 0..3 {
        channel
            .add_candidate(&id, &IceCandidateRecord::new(candidate(n), "alice"))
            .await
            .unwrap();
    }
    for n in 3..5 {
        channel
            .add_candidate(&id, &IceCandidateRecord::new(candidate(n), "bob"))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Vor dem Answer wird nur gepuffert
    let caller_peer = h.alice.peers.peer(0);
    assert_eq!(caller_peer.applied(), 0);

    wait_for("incoming call at bob", || {
        h.bob.coordinator.pending_incoming().len() == 1
    })
    .await;
    h.bob.coordinator.answer_call(&id).await.unwrap();

    wait_for("buffered candidates applied", || caller_peer.applied() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(caller_peer.applied(), 2);

    // bob wendet nur alice' Candidates an
    wait_for("callee candidates applied", || h.bob.peers.peer(0).applied() == 3).await;
}

// ============================================================================
// TIMEOUTS & FAILURES
// ============================================================================

#[tokio::test]
async fn test_ring_timer_does_not_end_connected_call() {
    let h = Harness::with_config(config_with_ring_timeout(300));
    h.connected_call().await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(h.alice.coordinator.phase().is_connected());
    assert!(h.bob.coordinator.phase().is_connected());
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    let h = Harness::with_config(config_with_ring_timeout(300));
    let id = h
        .alice
        .coordinator
        .initiate_call("bob", MediaKind::Video)
        .await
        .unwrap();
    assert_eq!(h.alice.media.live_track_count(), 2);

    wait_for("ring timeout", || {
        ended_with(&h.alice.coordinator.phase(), EndReason::Timeout)
    })
    .await;

    let issued = h.alice.media.issued_tracks();
    assert_eq!(issued.len(), 2);
    assert!(issued.iter().any(|t| t.kind() == TrackKind::Video));
    assert!(issued.iter().all(|t| !t.is_live()));
    assert_eq!(h.alice.media.live_track_count(), 0);
    assert!(!h.alice.coordinator.snapshot().in_call);
    assert_eq!(h.session_status(&id).await, CallStatus::Ended);
    wait_for("incoming call withdrawn", || {
        h.bob.coordinator.pending_incoming().is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_transport_failure_ends_call_on_both_sides() {
    let h = Harness::new();
    let id = h.connected_call().await;

    h.alice.peers.peer(0).emit_state(PeerState::Failed);

    wait_for("connection lost", || {
        ended_with(&h.alice.coordinator.phase(), EndReason::ConnectionLost)
    })
    .await;
    let session = h.channel().get_session(&id).await.unwrap().unwrap();
    assert_eq!(session.status, CallStatus::Ended);
    assert!(session.ended_at.is_some());

    wait_for("remote hangup at bob", || {
        ended_with(&h.bob.coordinator.phase(), EndReason::RemoteHangup)
    })
    .await;
}

#[tokio::test]
async fn test_disconnected_transport_ends_call_on_both_sides() {
    let h = Harness::new();
    let id = h.connected_call().await;

    h.bob.peers.peer(0).emit_state(PeerState::Disconnected);

    wait_for("connection lost", || {
        ended_with(&h.bob.coordinator.phase(), EndReason::ConnectionLost)
    })
    .await;
    assert_eq!(h.bob.media.live_track_count(), 0);
    let session = h.channel().get_session(&id).await.unwrap().unwrap();
    assert_eq!(session.status, CallStatus::Ended);
    assert!(session.ended_at.is_some());

    wait_for("remote hangup at alice", || {
        ended_with(&h.alice.coordinator.phase(), EndReason::RemoteHangup)
    })
    .await;
    assert_eq!(h.alice.peers.peer(0).closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_deleted_session_ends_call_on_both_sides() {
    let h = Harness::new();
    let id = h.connected_call().await;

    h.channel().delete_session(&id).await.unwrap();

    wait_for("remote hangup at both sides", || {
        ended_with(&h.alice.coordinator.phase(), EndReason::RemoteHangup)
            && ended_with(&h.bob.coordinator.phase(), EndReason::RemoteHangup)
    })
    .await;
    assert!(h.channel().get_session(&id).await.unwrap().is_none());
    assert_eq!(h.alice.media.live_track_count(), 0);
    assert_eq!(h.bob.media.live_track_count(), 0);
}

#[tokio::test]
async fn test_teardown_write_failure_still_clears_local_state() {
    let h = Harness::new();
    let id = h.connected_call().await;

    h.store.fail_merges.store(true, Ordering::SeqCst);
    h.alice.coordinator.end_call().await;

    assert!(ended_with(&h.alice.coordinator.phase(), EndReason::LocalHangup));
    assert!(!h.alice.coordinator.snapshot().in_call);
    assert_eq!(h.alice.media.live_track_count(), 0);
    assert_eq!(h.session_status(&id).await, CallStatus::Connected);
}

#[tokio::test]
async fn test_callee_setup_failure_ends_session() {
    let h = Harness::new();
    let id = h
        .alice
        .coordinator
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    wait_for("incoming call at bob", || {
        h.bob.coordinator.pending_incoming().len() == 1
    })
    .await;

    h.bob.peers.fail_connect.store(true, Ordering::SeqCst);
    let err = h.bob.coordinator.answer_call(&id).await.unwrap_err();
    assert!(matches!(err, CallError::Transport(_)));
    assert_eq!(h.bob.media.live_track_count(), 0);

    wait_for("remote hangup at alice", || {
        ended_with(&h.alice.coordinator.phase(), EndReason::RemoteHangup)
    })
    .await;
}

// ============================================================================
// GUARDS
// ============================================================================

#[tokio::test]
async fn test_concurrent_answers_connect_once() {
    let h = Harness::new();
    let id = h
        .alice
        .coordinator
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    wait_for("incoming call at bob", || {
        h.bob.coordinator.pending_incoming().len() == 1
    })
    .await;

    let (first, second) = tokio::join!(
        h.bob.coordinator.answer_call(&id),
        h.bob.coordinator.answer_call(&id)
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(|r| r.err()).unwrap();
    assert!(matches!(
        err,
        CallError::AlreadyAnswering(_) | CallError::AlreadyInCall
    ));
    assert_eq!(h.bob.peers.connects(), 1);
}

#[tokio::test]
async fn test_answer_on_second_device_is_rejected() {
    let h = Harness::new();
    let bob_tablet = Side::new(&h.store, "bob", config_with_ring_timeout(5_000));
    let id = h.connected_call().await;

    let err = bob_tablet.coordinator.answer_call(&id).await.unwrap_err();
    assert_eq!(err, CallError::AlreadyAnswered(id));
    assert_eq!(bob_tablet.peers.connects(), 0);
    assert!(h.alice.coordinator.phase().is_connected());
}

#[tokio::test]
async fn test_media_denied_writes_nothing() {
    let h = Harness::new();
    h.alice.media.set_permission(false);
    let mut events = h.alice.coordinator.subscribe();

    let err = h
        .alice
        .coordinator
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap_err();
    assert_eq!(err, CallError::MediaAccess(MediaAccessError::PermissionDenied));
    assert_eq!(h.store.memory.len(CALLS_COLLECTION), 0);
    assert_eq!(h.alice.coordinator.phase(), CallPhase::Idle);
    assert!(!h.alice.coordinator.snapshot().in_call);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, CallEvent::Error(_))));

    // Danach ist ein neuer Versuch möglich
    h.alice.media.set_permission(true);
    assert!(h
        .alice
        .coordinator
        .initiate_call("bob", MediaKind::Audio)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_answer_unknown_session() {
    let h = Harness::new();
    let err = h.bob.coordinator.answer_call("missing").await.unwrap_err();
    assert_eq!(err, CallError::SessionNotFound("missing".to_string()));
    assert_eq!(h.bob.peers.connects(), 0);
}

#[tokio::test]
async fn test_signed_out_user_cannot_call() {
    let h = Harness::new();
    h.alice.identity.sign_out();

    let err = h
        .alice
        .coordinator
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap_err();
    assert_eq!(err, CallError::NotAuthenticated);
    assert_eq!(h.alice.media.issued_tracks().len(), 0);
}

#[tokio::test]
async fn test_invalid_targets() {
    let h = Harness::new();
    for target in ["", "  ", "alice"] {
        let err = h
            .alice
            .coordinator
            .initiate_call(target, MediaKind::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidTarget(_)));
    }
}

#[tokio::test]
async fn test_second_call_while_busy() {
    let h = Harness::new();
    h.alice
        .coordinator
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();

    let err = h
        .alice
        .coordinator
        .initiate_call("carol", MediaKind::Audio)
        .await
        .unwrap_err();
    assert_eq!(err, CallError::AlreadyInCall);
    assert!(h.alice.coordinator.phase().is_ringing());
}

#[tokio::test]
async fn test_duplicate_ringing_call_from_other_device() {
    let h = Harness::new();
    let alice_laptop = Side::new(&h.store, "alice", config_with_ring_timeout(5_000));

    h.alice
        .coordinator
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    let err = alice_laptop
        .coordinator
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap_err();

    assert_eq!(err, CallError::DuplicateCall("bob".to_string()));
    assert_eq!(alice_laptop.media.live_track_count(), 0);
    assert_eq!(h.store.memory.len(CALLS_COLLECTION), 1);
}

// ============================================================================
// REJECT / WITHDRAW / SIGN-OUT
// ============================================================================

#[tokio::test]
async fn test_rejected_call_reaches_caller() {
    let h = Harness::new();
    let id = h
        .alice
        .coordinator
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    wait_for("incoming call at bob", || {
        h.bob.coordinator.pending_incoming().len() == 1
    })
    .await;

    h.bob.coordinator.reject_call(&id).await.unwrap();
    assert!(h.bob.coordinator.pending_incoming().is_empty());
    assert_eq!(h.bob.peers.connects(), 0);

    wait_for("caller sees rejection", || {
        h.alice.coordinator.phase() == CallPhase::Rejected { session_id: id.clone() }
    })
    .await;
    assert_eq!(h.alice.media.live_track_count(), 0);
    assert_eq!(h.session_status(&id).await, CallStatus::Rejected);
}

#[tokio::test]
async fn test_abandoned_incoming_call_expires() {
    let h = Harness::with_config(config_with_ring_timeout(300));
    let mut callee_events = h.bob.coordinator.subscribe();

    // Anrufer ohne Koordinator: schreibt Session und Offer, danach nie wieder etwas
    let session = CallSession {
        offer: Some(SessionDescription::offer("v=0 offer")),
        ..CallSession::ringing("abandoned", "carol", "bob", MediaKind::Audio, now_ms())
    };
    h.channel().create_session(&session).await.unwrap();

    wait_for("incoming call at bob", || {
        h.bob.coordinator.pending_incoming().len() == 1
    })
    .await;
    wait_for("incoming call expired", || {
        h.bob.coordinator.pending_incoming().is_empty()
    })
    .await;

    let events = drain(&mut callee_events);
    assert!(events.iter().any(
        |e| matches!(e, CallEvent::IncomingCallWithdrawn { session_id } if session_id == "abandoned")
    ));

    let result = h.bob.coordinator.answer_call("abandoned").await;
    assert!(matches!(result, Err(CallError::NotRinging(_))));
    assert_eq!(h.bob.peers.connects(), 0);
    assert_eq!(h.bob.media.live_track_count(), 0);
    assert!(!h.bob.coordinator.snapshot().in_call);
    assert_eq!(h.session_status("abandoned").await, CallStatus::Ringing);
}

#[tokio::test]
async fn test_caller_cancel_withdraws_incoming_call() {
    let h = Harness::new();
    let mut callee_events = h.bob.coordinator.subscribe();

    let id = h
        .alice
        .coordinator
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    wait_for("incoming call at bob", || {
        h.bob.coordinator.pending_incoming().len() == 1
    })
    .await;

    h.alice.coordinator.end_call().await;
    wait_for("incoming call withdrawn", || {
        h.bob.coordinator.pending_incoming().is_empty()
    })
    .await;

    let events = drain(&mut callee_events);
    assert!(events
        .iter()
        .any(|e| matches!(e, CallEvent::IncomingCall(call) if call.session_id == id)));
    assert!(events.iter().any(
        |e| matches!(e, CallEvent::IncomingCallWithdrawn { session_id } if *session_id == id)
    ));
}

#[tokio::test]
async fn test_sign_out_ends_active_call() {
    let h = Harness::new();
    h.connected_call().await;

    h.alice.identity.sign_out();
    wait_for("signed out", || {
        ended_with(&h.alice.coordinator.phase(), EndReason::SignedOut)
    })
    .await;
    assert_eq!(h.alice.media.live_track_count(), 0);
}

#[tokio::test]
async fn test_controls_apply_to_local_tracks() {
    let h = Harness::new();
    h.alice.coordinator.set_muted(true);
    assert!(!h.alice.coordinator.is_muted());

    h.alice
        .coordinator
        .initiate_call("bob", MediaKind::Video)
        .await
        .unwrap();
    h.alice.coordinator.set_muted(true);
    h.alice.coordinator.set_video_enabled(false);

    let snapshot = h.alice.coordinator.snapshot();
    assert!(snapshot.muted);
    assert!(!snapshot.video_enabled);
    let enabled: Vec<bool> = h
        .alice
        .media
        .issued_tracks()
        .iter()
        .map(|t| t.is_enabled())
        .collect();
    assert_eq!(enabled, vec![false, false]);
}

// ============================================================================
// HISTORY
// ============================================================================

#[tokio::test]
async fn test_finished_call_is_recorded() {
    let store = Arc::new(FlakyStore::default());
    let db = Arc::new(CallDatabase::open_in_memory().unwrap());
    let config = config_with_ring_timeout(5_000);
    let alice = Side::with_history(&store, "alice", config.clone(), Some(Arc::clone(&db)));
    let bob = Side::new(&store, "bob", config);

    let id = alice
        .coordinator
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();
    wait_for("incoming call at bob", || {
        bob.coordinator.pending_incoming().len() == 1
    })
    .await;
    bob.coordinator.answer_call(&id).await.unwrap();
    wait_for("caller connected", || alice.coordinator.phase().is_connected()).await;

    alice.coordinator.end_call().await;

    let calls = alice.coordinator.recent_calls(10);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].session_id, id);
    assert_eq!(calls[0].peer_id, "bob");
    assert_eq!(calls[0].direction, CallDirection::Outbound);
    assert_eq!(calls[0].outcome, EndReason::LocalHangup);
    assert!(calls[0].connected_at.is_some());
}

#[tokio::test]
async fn test_history_write_does_not_block_runtime() {
    let store = Arc::new(FlakyStore::default());
    let db = Arc::new(CallDatabase::open_in_memory().unwrap());
    let alice = Side::with_history(
        &store,
        "alice",
        config_with_ring_timeout(5_000),
        Some(Arc::clone(&db)),
    );
    alice
        .coordinator
        .initiate_call("bob", MediaKind::Audio)
        .await
        .unwrap();

    // Datenbank für 300ms von einem anderen Thread sperren
    let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
    let busy = Arc::clone(&db);
    let holder = std::thread::spawn(move || {
        busy.with_locked(|| {
            let _ = locked_tx.send(());
            std::thread::sleep(Duration::from_millis(300));
        })
    });
    locked_rx.await.unwrap();

    let ticker = tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Instant::now()
    });
    alice.coordinator.end_call().await;
    let ended = Instant::now();

    assert!(ticker.await.unwrap() < ended);
    holder.join().unwrap();
    assert_eq!(alice.coordinator.recent_calls(10).len(), 1);
    assert!(ended_with(&alice.coordinator.phase(), EndReason::LocalHangup));
}
