//! Call Session Coordinator
//!
//! Besitzt die Zustandsmaschine eines Anrufs und vermittelt zwischen
//! Media, Peer Connection und Signaling-Store:
//! - `initiate_call`: Media holen, Session anlegen, Offer schreiben, auf Answer warten
//! - `answer_call`: Offer anwenden, Answer + `connected` schreiben
//! - `end_call`: idempotent, lokaler Teardown hat immer Vorrang
//! - Erkennung eingehender Anrufe solange jemand angemeldet ist
//!
//! Jeder Aufbau prüft nach jedem `await`, ob sein Kontext noch aktuell ist.
//! Hintergrund-Tasks beenden Anrufe nur über [`CallCoordinator::spawn_finish`],
//! damit kein Task sich selbst abbricht.

use super::context::CallContext;
use super::error::CallError;
use super::state::{CallDirection, CallEvent, CallPhase, CallSnapshot, EndReason, IncomingCall};
use crate::config::CallConfig;
use crate::database::{CallDatabase, CallRecord};
use crate::identity::{Identity, IdentityProvider};
use crate::media::{MediaDevices, MediaStream, MediaTrack, TrackKind};
use crate::peer::{PeerConnection, PeerConnector, PeerLink, WebRtcConnector};
use crate::profiles::{ProfileDirectory, StoreProfiles};
use crate::signaling::{
    CallSession, CallStatus, DocumentStore, MediaKind, SessionDescription, SignalingChannel,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// `{createdAtMillis}_{callerId}_{8 hex}`
pub(crate) fn new_session_id(created_at: i64, caller_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", created_at, caller_id, &suffix[..8])
}

// ============================================================================
// SHARED STATE
// ============================================================================

pub(crate) struct Inner {
    pub config: CallConfig,
    pub channel: SignalingChannel,
    pub media: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn PeerConnector>,
    pub identity: IdentityProvider,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub history: Option<Arc<CallDatabase>>,
    pub context: Mutex<Option<CallContext>>,
    pub phase: Mutex<CallPhase>,
    pub pending: Mutex<HashMap<String, IncomingCall>>,
    /// Sessions, die gerade lokal angenommen werden
    pub answering: Mutex<HashSet<String>>,
    pub generation: AtomicU64,
    pub event_tx: broadcast::Sender<CallEvent>,
    pub incoming_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.incoming_task.lock().take() {
            task.abort();
        }
    }
}

/// Entfernt eine Session aus `answering`, egal wie `answer_call` endet
struct AnsweringGuard<'a> {
    inner: &'a Inner,
    session_id: String,
}

impl Drop for AnsweringGuard<'_> {
    fn drop(&mut self) {
        self.inner.answering.lock().remove(&self.session_id);
    }
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct CallCoordinatorBuilder {
    store: Arc<dyn DocumentStore>,
    identity: IdentityProvider,
    config: CallConfig,
    media: Option<Arc<dyn MediaDevices>>,
    connector: Option<Arc<dyn PeerConnector>>,
    profiles: Option<Arc<dyn ProfileDirectory>>,
    history: Option<Arc<CallDatabase>>,
}

impl CallCoordinatorBuilder {
    pub fn config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    pub fn media(mut self, media: Arc<dyn MediaDevices>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn profiles(mut self, profiles: Arc<dyn ProfileDirectory>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// Anrufprotokoll und Profil-Cache
    pub fn history(mut self, database: Arc<CallDatabase>) -> Self {
        self.history = Some(database);
        self
    }

    /// Baut den Koordinator. Die Erkennung eingehender Anrufe startet erst mit
    /// [`CallCoordinator::start`].
    pub fn build(self) -> CallCoordinator {
        let media = self.media.unwrap_or_else(default_media);
        let connector: Arc<dyn PeerConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WebRtcConnector::from_config(&self.config)),
        };
        let profiles: Arc<dyn ProfileDirectory> = match self.profiles {
            Some(profiles) => profiles,
            None => {
                let profiles = StoreProfiles::new(Arc::clone(&self.store));
                match &self.history {
                    Some(db) => Arc::new(profiles.with_cache(Arc::clone(db))),
                    None => Arc::new(profiles),
                }
            }
        };

        let (event_tx, _) = broadcast::channel(100);

        CallCoordinator {
            inner: Arc::new(Inner {
                config: self.config,
                channel: SignalingChannel::new(self.store),
                media,
                connector,
                identity: self.identity,
                profiles,
                history: self.history,
                context: Mutex::new(None),
                phase: Mutex::new(CallPhase::Idle),
                pending: Mutex::new(HashMap::new()),
                answering: Mutex::new(HashSet::new()),
                generation: AtomicU64::new(0),
                event_tx,
                incoming_task: Mutex::new(None),
            }),
        }
    }
}

#[cfg(feature = "device-audio")]
fn default_media() -> Arc<dyn MediaDevices> {
    Arc::new(crate::media::DeviceMediaDevices::new())
}

#[cfg(not(feature = "device-audio"))]
fn default_media() -> Arc<dyn MediaDevices> {
    Arc::new(crate::media::SyntheticMediaDevices::new())
}

// ============================================================================
// CALL COORDINATOR
// ============================================================================

/// Handle auf den Koordinator. Klone teilen denselben Anrufzustand.
#[derive(Clone)]
pub struct CallCoordinator {
    pub(crate) inner: Arc<Inner>,
}

impl CallCoordinator {
    pub fn builder(store: Arc<dyn DocumentStore>, identity: IdentityProvider) -> CallCoordinatorBuilder {
        CallCoordinatorBuilder {
            store,
            identity,
            config: CallConfig::default(),
            media: None,
            connector: None,
            profiles: None,
            history: None,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn phase(&self) -> CallPhase {
        self.inner.phase.lock().clone()
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    pub fn pending_incoming(&self) -> Vec<IncomingCall> {
        let mut calls: Vec<_> = self.inner.pending.lock().values().cloned().collect();
        calls.sort_by_key(|c| c.created_at);
        calls
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let phase = self.phase();
        let pending_incoming = self.pending_incoming();
        let context = self.inner.context.lock();

        match context.as_ref() {
            Some(ctx) => CallSnapshot {
                phase,
                in_call: true,
                has_local_stream: ctx.local_stream.is_some(),
                local_track_count: ctx.live_local_tracks(),
                remote_tracks: ctx.remote_tracks.clone(),
                muted: ctx.muted,
                video_enabled: ctx.video_enabled,
                duration_ms: ctx.connected_at.map(|t| now_ms().saturating_sub(t).max(0)),
                pending_incoming,
            },
            None => CallSnapshot {
                phase,
                in_call: false,
                has_local_stream: false,
                local_track_count: 0,
                remote_tracks: Vec::new(),
                muted: false,
                video_enabled: false,
                duration_ms: None,
                pending_incoming,
            },
        }
    }

    /// Letzte Anrufe aus dem Protokoll (leer ohne Datenbank)
    pub fn recent_calls(&self, limit: usize) -> Vec<CallRecord> {
        let Some(history) = &self.inner.history else {
            return Vec::new();
        };
        history.recent_calls(limit).unwrap_or_else(|e| {
            tracing::warn!("Failed to read call log: {}", e);
            Vec::new()
        })
    }

    // ========================================================================
    // CALL CONTROLS
    // ========================================================================

    /// Schaltet das Mikrofon stumm. Ohne aktiven Anruf wirkungslos.
    pub fn set_muted(&self, muted: bool) {
        if let Some(ctx) = self.inner.context.lock().as_mut() {
            ctx.set_track_enabled(TrackKind::Audio, !muted);
            ctx.muted = muted;
            tracing::debug!("Audio muted: {}", muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.inner
            .context
            .lock()
            .as_ref()
            .map(|c| c.muted)
            .unwrap_or(false)
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        if let Some(ctx) = self.inner.context.lock().as_mut() {
            ctx.set_track_enabled(TrackKind::Video, enabled);
            ctx.video_enabled = enabled && ctx.media_kind.wants_video();
        }
    }

    // ========================================================================
    // INITIATE
    // ========================================================================

    /// Startet einen ausgehenden Anruf und gibt die Session-ID zurück.
    ///
    /// Kehrt zurück sobald das Offer geschrieben ist. Ob der Angerufene annimmt,
    /// zeigt ein späteres [`CallEvent::StateChanged`] mit `Connected`.
    pub async fn initiate_call(
        &self,
        target_id: &str,
        media_kind: MediaKind,
    ) -> Result<String, CallError> {
        let identity = self
            .inner
            .identity
            .current()
            .ok_or(CallError::NotAuthenticated)?;

        let target_id = target_id.trim();
        if target_id.is_empty() || target_id == identity.user_id {
            return Err(CallError::InvalidTarget(target_id.to_string()));
        }

        let created_at = now_ms();
        let session_id = new_session_id(created_at, &identity.user_id);
        let generation = self.claim(CallContext::new(
            session_id.clone(),
            target_id.to_string(),
            CallDirection::Outbound,
            media_kind,
            created_at,
        ))?;

        tracing::info!(
            "Starting {} call {} to {}",
            media_kind,
            session_id,
            target_id
        );

        match self
            .setup_outbound(generation, &identity, target_id, media_kind, &session_id, created_at)
            .await
        {
            Ok(()) => Ok(session_id),
            Err(e) => {
                self.abort_setup(generation, &e).await;
                Err(e)
            }
        }
    }

    async fn setup_outbound(
        &self,
        generation: u64,
        identity: &Identity,
        target_id: &str,
        media_kind: MediaKind,
        session_id: &str,
        created_at: i64,
    ) -> Result<(), CallError> {
        let channel = &self.inner.channel;

        // Kein zweiter klingelnder Anruf für dasselbe Paar
        let ringing = channel.ringing_between(&identity.user_id, target_id).await?;
        self.ensure_current(generation)?;
        let now = now_ms();
        if ringing
            .iter()
            .any(|s| !s.ring_expired(now, self.inner.config.ring_timeout_ms))
        {
            return Err(CallError::DuplicateCall(target_id.to_string()));
        }

        let stream = self
            .inner
            .media
            .acquire(media_kind.wants_audio(), media_kind.wants_video())
            .await?;
        let tracks = self.attach_stream(generation, stream)?;

        let session =
            CallSession::ringing(session_id, &identity.user_id, target_id, media_kind, created_at);
        channel.create_session(&session).await?;
        if self.ensure_current(generation).is_err() {
            // end_call kam während des Schreibens, das Dokument darf nicht klingeln bleiben
            if let Err(e) = channel
                .mark_finished(session_id, CallStatus::Ended, now_ms())
                .await
            {
                tracing::warn!("Failed to end abandoned call {}: {}", session_id, e);
            }
            return Err(CallError::Cancelled);
        }
        self.with_context(generation, |ctx| ctx.session_written = true)?;

        self.set_phase(CallPhase::Ringing {
            session_id: session_id.to_string(),
            peer_id: target_id.to_string(),
            direction: CallDirection::Outbound,
            media_kind,
        });

        let peer = self.connect_peer(generation, session_id, &identity.user_id).await?;
        for track in &tracks {
            peer.add_local_track(track).await?;
        }
        self.ensure_current(generation)?;

        let offer = peer.create_offer().await?;
        self.ensure_current(generation)?;
        channel.write_offer(session_id, &offer).await?;
        self.ensure_current(generation)?;
        tracing::debug!("Offer written for {}", session_id);

        self.start_signal_watch(generation, session_id, &identity.user_id, peer, CallDirection::Outbound)
            .await?;
        self.start_ring_timer(generation, session_id)?;
        Ok(())
    }

    // ========================================================================
    // ANSWER
    // ========================================================================

    /// Nimmt einen eingehenden Anruf an
    pub async fn answer_call(&self, session_id: &str) -> Result<(), CallError> {
        let identity = self
            .inner
            .identity
            .current()
            .ok_or(CallError::NotAuthenticated)?;

        // Doppelte Taps erkennen, bevor irgendetwas wartet
        if !self.inner.answering.lock().insert(session_id.to_string()) {
            return Err(CallError::AlreadyAnswering(session_id.to_string()));
        }
        let _guard = AnsweringGuard {
            inner: &self.inner,
            session_id: session_id.to_string(),
        };
        if self.inner.context.lock().is_some() {
            return Err(CallError::AlreadyInCall);
        }

        let session = self.load_answerable(session_id, &identity).await?;
        let offer = session
            .offer
            .clone()
            .ok_or_else(|| CallError::OfferMissing(session_id.to_string()))?;

        let mut context = CallContext::new(
            session.id.clone(),
            session.caller_id.clone(),
            CallDirection::Inbound,
            session.media_kind,
            session.created_at,
        );
        context.session_written = true;
        let generation = self.claim(context)?;
        self.inner.pending.lock().remove(session_id);

        tracing::info!(
            "Answering {} call {} from {}",
            session.media_kind,
            session_id,
            session.caller_id
        );
        self.set_phase(CallPhase::Ringing {
            session_id: session.id.clone(),
            peer_id: session.caller_id.clone(),
            direction: CallDirection::Inbound,
            media_kind: session.media_kind,
        });

        match self.setup_inbound(generation, &identity, &session, &offer).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort_setup(generation, &e).await;
                Err(e)
            }
        }
    }

    /// Liest die Session und prüft, ob wir sie annehmen dürfen
    async fn load_answerable(
        &self,
        session_id: &str,
        identity: &Identity,
    ) -> Result<CallSession, CallError> {
        let session = self
            .inner
            .channel
            .get_session(session_id)
            .await?
            .ok_or_else(|| CallError::SessionNotFound(session_id.to_string()))?;

        if session.target_id != identity.user_id {
            return Err(CallError::NotAddressedToYou(session_id.to_string()));
        }
        if session.answer.is_some() {
            return Err(CallError::AlreadyAnswered(session_id.to_string()));
        }
        if session.status != CallStatus::Ringing {
            return Err(CallError::NotRinging(session_id.to_string()));
        }
        // Ein abgestürzter Anrufer schreibt kein `ended`
        if session.ring_expired(now_ms(), self.inner.config.ring_timeout_ms) {
            return Err(CallError::NotRinging(session_id.to_string()));
        }
        Ok(session)
    }

    async fn setup_inbound(
        &self,
        generation: u64,
        identity: &Identity,
        session: &CallSession,
        offer: &SessionDescription,
    ) -> Result<(), CallError> {
        let channel = &self.inner.channel;
        let session_id = session.id.as_str();

        let stream = self
            .inner
            .media
            .acquire(session.media_kind.wants_audio(), session.media_kind.wants_video())
            .await?;
        let tracks = self.attach_stream(generation, stream)?;

        let peer = self.connect_peer(generation, session_id, &identity.user_id).await?;
        peer.set_remote_description(offer).await?;
        for track in &tracks {
            peer.add_local_track(track).await?;
        }
        self.ensure_current(generation)?;

        // Jemand anderes könnte inzwischen geantwortet oder der Anrufer aufgelegt haben
        self.load_answerable(session_id, identity).await?;
        self.ensure_current(generation)?;

        let answer = peer.create_answer().await?;
        self.ensure_current(generation)?;

        let connected_at = now_ms();
        channel.write_answer(session_id, &answer, connected_at).await?;
        self.ensure_current(generation)?;
        tracing::debug!("Answer written for {}", session_id);

        self.mark_connected(generation, connected_at);
        self.start_signal_watch(generation, session_id, &identity.user_id, peer, CallDirection::Inbound)
            .await
    }

    // ========================================================================
    // REJECT / END
    // ========================================================================

    /// Lehnt einen eingehenden Anruf ab
    pub async fn reject_call(&self, session_id: &str) -> Result<(), CallError> {
        let identity = self
            .inner
            .identity
            .current()
            .ok_or(CallError::NotAuthenticated)?;

        self.load_answerable(session_id, &identity).await?;
        self.inner
            .channel
            .mark_finished(session_id, CallStatus::Rejected, now_ms())
            .await?;

        tracing::info!("Rejected call {}", session_id);
        if self.inner.pending.lock().remove(session_id).is_some() {
            self.emit(CallEvent::IncomingCallWithdrawn {
                session_id: session_id.to_string(),
            });
        }
        Ok(())
    }

    /// Beendet den aktuellen Anruf. Idempotent, aus jedem Zustand aufrufbar.
    pub async fn end_call(&self) {
        self.finish(None, EndReason::LocalHangup).await;
    }

    /// Stoppt die Erkennung eingehender Anrufe und beendet einen laufenden Anruf
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.incoming_task.lock().take() {
            task.abort();
        }
        self.end_call().await;
    }

    /// Teardown. Mit `generation` nur, wenn der Kontext noch zu diesem Aufbau gehört.
    ///
    /// Der lokale Zustand wird zuerst entfernt, der Status-Write ist best-effort.
    pub(crate) async fn finish(&self, generation: Option<u64>, reason: EndReason) -> bool {
        let Some(mut ctx) = self.take_context(generation) else {
            return false;
        };

        tracing::info!("Ending call {} ({})", ctx.session_id, reason);

        if let Some(peer) = ctx.release() {
            if let Err(e) = peer.close().await {
                tracing::warn!("Failed to close peer connection for {}: {}", ctx.session_id, e);
            }
        }

        let ended_at = now_ms();
        let remote_already_final = matches!(reason, EndReason::RemoteHangup | EndReason::Rejected);
        if ctx.session_written && !remote_already_final {
            if let Err(e) = self
                .inner
                .channel
                .mark_finished(&ctx.session_id, CallStatus::Ended, ended_at)
                .await
            {
                tracing::warn!("Failed to mark call {} as ended: {}", ctx.session_id, e);
            }
        }

        if ctx.session_written {
            self.record_history(&ctx, reason, ended_at).await;
        }

        let phase = match reason {
            EndReason::Rejected => CallPhase::Rejected {
                session_id: ctx.session_id.clone(),
            },
            _ => CallPhase::Ended {
                session_id: ctx.session_id.clone(),
                reason,
            },
        };
        // Während des Teardowns kann bereits ein neuer Anruf begonnen haben
        if self.inner.context.lock().is_some() {
            tracing::debug!("Skipping phase update for {}, a newer call is active", ctx.session_id);
            return true;
        }
        self.set_phase(phase);
        true
    }

    /// Teardown aus einem Hintergrund-Task heraus
    pub(crate) fn spawn_finish(&self, generation: u64, reason: EndReason) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.finish(Some(generation), reason).await;
        });
    }

    /// Räumt einen gescheiterten Aufbau ab
    async fn abort_setup(&self, generation: u64, error: &CallError) {
        if *error == CallError::Cancelled {
            return;
        }
        tracing::error!("Call setup failed: {}", error);
        self.emit(CallEvent::Error(error.user_message().to_string()));

        // Hat ein anderes Gerät schon geantwortet, gehört das Dokument nicht mehr uns
        let lost_race = matches!(
            error,
            CallError::AlreadyAnswered(_) | CallError::NotRinging(_) | CallError::SessionNotFound(_)
        );
        let state = self.with_context(generation, |ctx| {
            if lost_race {
                ctx.session_written = false;
            }
            (ctx.session_written, ctx.direction)
        });

        match state {
            Ok((true, _)) | Ok((_, CallDirection::Inbound)) => {
                self.finish(Some(generation), EndReason::SetupFailed).await;
            }
            Ok(_) => {
                // Noch kein Dokument: nur lokal freigeben, Phase bleibt
                drop(self.take_context(Some(generation)));
            }
            Err(_) => {}
        }
    }

    /// Entfernt den Kontext. Mit `generation` nur, wenn er noch zu diesem Aufbau gehört.
    fn take_context(&self, generation: Option<u64>) -> Option<CallContext> {
        let mut guard = self.inner.context.lock();
        let current = guard.as_ref().map(|ctx| ctx.generation);
        match (current, generation) {
            (Some(c), Some(g)) if c != g => None,
            _ => guard.take(),
        }
    }

    /// Schreibt den Eintrag ins Anrufprotokoll. rusqlite blockiert, daher
    /// auf dem Blocking-Pool.
    async fn record_history(&self, ctx: &CallContext, reason: EndReason, ended_at: i64) {
        let Some(history) = self.inner.history.clone() else {
            return;
        };
        let record = CallRecord {
            session_id: ctx.session_id.clone(),
            peer_id: ctx.peer_id.clone(),
            direction: ctx.direction,
            media_kind: ctx.media_kind,
            outcome: reason,
            created_at: ctx.created_at,
            connected_at: ctx.connected_at,
            ended_at,
        };
        match tokio::task::spawn_blocking(move || history.record_call(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to record call {}: {}", ctx.session_id, e),
            Err(e) => tracing::warn!("Call log task for {} failed: {}", ctx.session_id, e),
        }
    }

    // ========================================================================
    // CONTEXT HELPERS
    // ========================================================================

    fn claim(&self, mut context: CallContext) -> Result<u64, CallError> {
        let mut guard = self.inner.context.lock();
        if guard.is_some() {
            return Err(CallError::AlreadyInCall);
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        context.generation = generation;
        *guard = Some(context);
        Ok(generation)
    }

    /// Führt `f` auf dem Kontext aus, sofern er noch zu `generation` gehört
    pub(crate) fn with_context<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut CallContext) -> R,
    ) -> Result<R, CallError> {
        match self.inner.context.lock().as_mut() {
            Some(ctx) if ctx.generation == generation => Ok(f(ctx)),
            _ => Err(CallError::Cancelled),
        }
    }

    pub(crate) fn ensure_current(&self, generation: u64) -> Result<(), CallError> {
        self.with_context(generation, |_| ())
    }

    /// Übernimmt den Stream in den Kontext und gibt seine Tracks zurück
    fn attach_stream(
        &self,
        generation: u64,
        stream: MediaStream,
    ) -> Result<Vec<MediaTrack>, CallError> {
        let tracks = stream.tracks().to_vec();
        // Bei veraltetem Kontext wird der Stream hier gedroppt und damit gestoppt
        self.with_context(generation, move |ctx| {
            ctx.video_enabled = ctx.media_kind.wants_video();
            ctx.local_stream = Some(stream);
        })?;
        Ok(tracks)
    }

    /// Baut die Peer Connection auf und startet ihren Event-Pump
    async fn connect_peer(
        &self,
        generation: u64,
        session_id: &str,
        self_id: &str,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let PeerLink { connection, events } = self.inner.connector.connect(session_id).await?;

        let stored = self.with_context(generation, |ctx| {
            ctx.peer = Some(Arc::clone(&connection));
        });
        if let Err(e) = stored {
            let _ = connection.close().await;
            return Err(e);
        }

        let task = tokio::spawn(super::tasks::pump_peer_events(
            Arc::downgrade(&self.inner),
            generation,
            session_id.to_string(),
            self_id.to_string(),
            events,
        ));
        self.register_task(generation, task)?;
        Ok(connection)
    }

    pub(crate) fn register_task(&self, generation: u64, task: JoinHandle<()>) -> Result<(), CallError> {
        match self.inner.context.lock().as_mut() {
            Some(ctx) if ctx.generation == generation => {
                ctx.push_task(task);
                Ok(())
            }
            _ => {
                task.abort();
                Err(CallError::Cancelled)
            }
        }
    }

    /// `Ringing` → `Connected`, genau einmal pro Anruf
    pub(crate) fn mark_connected(&self, generation: u64, connected_at: i64) -> bool {
        let connected = self.with_context(generation, |ctx| {
            if ctx.connected_at.is_some() {
                return None;
            }
            ctx.connected_at = Some(connected_at);
            Some(CallPhase::Connected {
                session_id: ctx.session_id.clone(),
                peer_id: ctx.peer_id.clone(),
                direction: ctx.direction,
                media_kind: ctx.media_kind,
                connected_at,
            })
        });

        match connected {
            Ok(Some(phase)) => {
                tracing::info!("Call {} connected", phase.session_id().unwrap_or_default());
                self.set_phase(phase);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_phase(&self, phase: CallPhase) {
        tracing::debug!("Call phase: {}", phase.name());
        *self.inner.phase.lock() = phase.clone();
        self.emit(CallEvent::StateChanged(phase));
    }

    pub(crate) fn emit(&self, event: CallEvent) {
        let _ = self.inner.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCoordinator")
            .field("phase", &self.phase())
            .field("in_call", &self.inner.context.lock().is_some())
            .field("pending", &self.inner.pending.lock().len())
            .finish()
    }
}
