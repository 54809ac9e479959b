//! Hintergrund-Tasks eines Koordinators
//!
//! - Peer-Event-Pump: lokale Candidates veröffentlichen, Verbindungsabbrüche erkennen
//! - Signal-Loop: Session-Dokument und Remote-Candidates beobachten
//! - Klingel-Timer
//! - Identity-Loop: eingehende Anrufe solange jemand angemeldet ist
//!
//! Alle Tasks halten nur eine `Weak`-Referenz auf den Koordinator und
//! beenden Anrufe über `spawn_finish`.

use super::coordinator::{now_ms, CallCoordinator, Inner};
use super::error::CallError;
use super::state::{CallDirection, CallEvent, EndReason, IncomingCall};
use crate::identity::Identity;
use crate::peer::{PeerConnection, PeerEvent};
use crate::signaling::{
    CallSession, CallStatus, CandidateWatch, IceCandidate, IceCandidateRecord, SessionWatch,
};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn upgrade(inner: &Weak<Inner>) -> Option<CallCoordinator> {
    inner.upgrade().map(|inner| CallCoordinator { inner })
}

// ============================================================================
// PEER EVENTS
// ============================================================================

pub(crate) async fn pump_peer_events(
    inner: Weak<Inner>,
    generation: u64,
    session_id: String,
    self_id: String,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(coordinator) = upgrade(&inner) else {
            break;
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let record = IceCandidateRecord::new(candidate, self_id.as_str());
                if let Err(e) = coordinator
                    .inner
                    .channel
                    .add_candidate(&session_id, &record)
                    .await
                {
                    tracing::warn!("Failed to publish ICE candidate for {}: {}", session_id, e);
                }
            }
            PeerEvent::StateChanged(state) => {
                tracing::debug!("Peer connection {} is {}", session_id, state);
                if state.is_failure() {
                    tracing::warn!("Connection lost for call {} ({})", session_id, state);
                    coordinator.spawn_finish(generation, EndReason::ConnectionLost);
                    break;
                }
            }
            PeerEvent::RemoteTrack(track) => {
                let stored = coordinator
                    .with_context(generation, |ctx| ctx.remote_tracks.push(track.clone()))
                    .is_ok();
                if stored {
                    tracing::info!("Remote {} track {} on {}", track.kind.as_str(), track.id, session_id);
                    coordinator.emit(CallEvent::RemoteTrack(track));
                }
            }
        }
    }
}

// ============================================================================
// SIGNAL LOOP
// ============================================================================

/// Beobachtet Session-Dokument und Candidates eines laufenden Anrufs
struct SignalLoop {
    inner: Weak<Inner>,
    generation: u64,
    session_id: String,
    self_id: String,
    direction: CallDirection,
    peer: Arc<dyn PeerConnection>,
    /// Bereits verarbeitete Candidate-Dokumente
    seen: HashSet<String>,
    /// Candidates, die vor der Remote Description ankamen
    buffered: Vec<IceCandidate>,
    remote_ready: bool,
}

impl SignalLoop {
    async fn run(mut self, mut session: SessionWatch, mut candidates: CandidateWatch) {
        loop {
            tokio::select! {
                update = session.next() => {
                    let Some(update) = update else {
                        tracing::warn!("Session watch for {} closed", self.session_id);
                        break;
                    };
                    if !self.on_session(update).await {
                        break;
                    }
                }
                batch = candidates.next() => {
                    let Some(batch) = batch else {
                        tracing::warn!("Candidate watch for {} closed", self.session_id);
                        break;
                    };
                    self.on_candidates(batch).await;
                }
            }
        }
    }

    /// `false` beendet die Schleife
    async fn on_session(&mut self, update: Option<CallSession>) -> bool {
        let Some(coordinator) = upgrade(&self.inner) else {
            return false;
        };

        let Some(session) = update else {
            tracing::info!("Call {} was deleted remotely", self.session_id);
            coordinator.spawn_finish(self.generation, EndReason::RemoteHangup);
            return false;
        };

        match session.status {
            CallStatus::Ended => {
                coordinator.spawn_finish(self.generation, EndReason::RemoteHangup);
                return false;
            }
            CallStatus::Rejected => {
                coordinator.spawn_finish(self.generation, EndReason::Rejected);
                return false;
            }
            CallStatus::Ringing | CallStatus::Connected => {}
        }

        if self.direction != CallDirection::Outbound {
            return true;
        }
        let Some(answer) = session.answer else {
            return true;
        };
        // Wiederholte Snapshots mit demselben Answer ignorieren
        if self.remote_ready || self.peer.has_remote_description().await {
            return true;
        }

        if let Err(e) = self.peer.set_remote_description(&answer).await {
            tracing::error!("Failed to apply answer for {}: {}", self.session_id, e);
            coordinator.emit(CallEvent::Error(CallError::from(e).user_message().to_string()));
            coordinator.spawn_finish(self.generation, EndReason::SetupFailed);
            return false;
        }
        self.remote_ready = true;
        self.flush_buffered().await;

        let connected_at = session.connected_at.unwrap_or_else(now_ms);
        coordinator.mark_connected(self.generation, connected_at);
        true
    }

    async fn on_candidates(&mut self, batch: Vec<(String, IceCandidateRecord)>) {
        for (doc_id, record) in batch {
            if !self.seen.insert(doc_id) {
                continue;
            }
            if record.from == self.self_id {
                tracing::trace!("Skipping own ICE candidate on {}", self.session_id);
                continue;
            }
            if self.remote_ready {
                self.apply(&record.candidate).await;
            } else {
                self.buffered.push(record.candidate);
            }
        }
    }

    async fn flush_buffered(&mut self) {
        let buffered = std::mem::take(&mut self.buffered);
        if !buffered.is_empty() {
            tracing::debug!(
                "Applying {} buffered ICE candidates for {}",
                buffered.len(),
                self.session_id
            );
        }
        for candidate in &buffered {
            self.apply(candidate).await;
        }
    }

    async fn apply(&self, candidate: &IceCandidate) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            tracing::warn!("Failed to add ICE candidate on {}: {}", self.session_id, e);
        }
    }
}

impl CallCoordinator {
    pub(super) async fn start_signal_watch(
        &self,
        generation: u64,
        session_id: &str,
        self_id: &str,
        peer: Arc<dyn PeerConnection>,
        direction: CallDirection,
    ) -> Result<(), CallError> {
        let session = self.inner.channel.watch_session(session_id).await?;
        self.ensure_current(generation)?;
        let candidates = self.inner.channel.watch_candidates(session_id).await?;
        self.ensure_current(generation)?;

        let signal_loop = SignalLoop {
            inner: Arc::downgrade(&self.inner),
            generation,
            session_id: session_id.to_string(),
            self_id: self_id.to_string(),
            direction,
            peer,
            seen: HashSet::new(),
            buffered: Vec::new(),
            // Der Angerufene setzt das Offer vor dem Answer
            remote_ready: direction == CallDirection::Inbound,
        };
        let task = tokio::spawn(signal_loop.run(session, candidates));
        self.register_task(generation, task)
    }

    /// Beendet einen unbeantworteten ausgehenden Anruf nach `ring_timeout`
    pub(super) fn start_ring_timer(&self, generation: u64, session_id: &str) -> Result<(), CallError> {
        let inner = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.ring_timeout();
        let session_id = session_id.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(coordinator) = upgrade(&inner) else {
                return;
            };
            let unanswered = coordinator
                .with_context(generation, |ctx| ctx.connected_at.is_none())
                .unwrap_or(false);
            if unanswered {
                tracing::info!("No answer for call {} after {:?}", session_id, timeout);
                coordinator.spawn_finish(generation, EndReason::Timeout);
            }
        });
        self.register_task(generation, task)
    }
}

// ============================================================================
// INCOMING CALLS
// ============================================================================

impl CallCoordinator {
    /// Startet die Erkennung eingehender Anrufe. Mehrfache Aufrufe sind wirkungslos.
    pub fn start(&self) {
        let mut slot = self.inner.incoming_task.lock();
        if slot.is_some() {
            return;
        }
        let identity = self.inner.identity.subscribe();
        *slot = Some(tokio::spawn(watch_identity(
            Arc::downgrade(&self.inner),
            identity,
        )));
    }

    /// Abmelden beendet den Anruf und verwirft alle eingehenden Anrufe
    async fn handle_signed_out(&self) {
        self.finish(None, EndReason::SignedOut).await;

        let withdrawn: Vec<String> = self.inner.pending.lock().drain().map(|(id, _)| id).collect();
        for session_id in withdrawn {
            self.emit(CallEvent::IncomingCallWithdrawn { session_id });
        }
    }

    /// Gleicht die sichtbaren klingelnden Sessions mit `pending` ab
    pub(super) async fn reconcile_incoming(&self, user_id: &str, sessions: Vec<CallSession>) {
        let now = now_ms();
        let ring_timeout = self.inner.config.ring_timeout_ms;
        let active = self
            .inner
            .context
            .lock()
            .as_ref()
            .map(|ctx| ctx.session_id.clone());
        let answering = self.inner.answering.lock().clone();

        let visible: Vec<CallSession> = sessions
            .into_iter()
            .filter(|s| {
                s.target_id == user_id
                    && s.caller_id != user_id
                    && s.status == CallStatus::Ringing
                    && s.offer.is_some()
                    && s.answer.is_none()
                    && !s.ring_expired(now, ring_timeout)
                    && active.as_deref() != Some(s.id.as_str())
            })
            .collect();
        let visible_ids: HashSet<&str> = visible.iter().map(|s| s.id.as_str()).collect();

        let withdrawn: Vec<String> = {
            let mut pending = self.inner.pending.lock();
            let gone: Vec<String> = pending
                .keys()
                .filter(|id| !visible_ids.contains(id.as_str()) && !answering.contains(*id))
                .cloned()
                .collect();
            for id in &gone {
                pending.remove(id);
            }
            gone
        };
        for session_id in withdrawn {
            tracing::debug!("Incoming call {} withdrawn", session_id);
            self.emit(CallEvent::IncomingCallWithdrawn { session_id });
        }

        let fresh: Vec<CallSession> = {
            let pending = self.inner.pending.lock();
            visible
                .into_iter()
                .filter(|s| !pending.contains_key(&s.id) && !answering.contains(&s.id))
                .collect()
        };

        for session in fresh {
            let caller_profile = match self.inner.profiles.lookup(&session.caller_id).await {
                Ok(profile) => Some(profile),
                Err(e) => {
                    tracing::debug!("No profile for caller {}: {}", session.caller_id, e);
                    None
                }
            };

            let call = IncomingCall {
                session_id: session.id.clone(),
                caller_id: session.caller_id.clone(),
                media_kind: session.media_kind,
                created_at: session.created_at,
                caller_profile,
            };

            let inserted = {
                let mut pending = self.inner.pending.lock();
                if pending.contains_key(&call.session_id) {
                    false
                } else {
                    pending.insert(call.session_id.clone(), call.clone());
                    true
                }
            };
            if inserted {
                tracing::info!(
                    "Incoming {} call {} from {}",
                    call.media_kind,
                    call.session_id,
                    call.caller_id
                );
                self.start_incoming_expiry(&call);
                self.emit(CallEvent::IncomingCall(call));
            }
        }
    }

    /// Verwirft einen eingehenden Anruf, sobald seine Klingelzeit abgelaufen ist.
    /// Ohne neuen Snapshot würde er sonst für immer in `pending` bleiben.
    fn start_incoming_expiry(&self, call: &IncomingCall) {
        let inner = Arc::downgrade(&self.inner);
        let session_id = call.session_id.clone();
        let remaining = (call.created_at + self.inner.config.ring_timeout_ms as i64 - now_ms()).max(0);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(remaining as u64)).await;
            let Some(coordinator) = upgrade(&inner) else {
                return;
            };

            let expired = {
                let answering = coordinator.inner.answering.lock();
                let mut pending = coordinator.inner.pending.lock();
                !answering.contains(&session_id) && pending.remove(&session_id).is_some()
            };
            if expired {
                tracing::debug!("Incoming call {} expired", session_id);
                coordinator.emit(CallEvent::IncomingCallWithdrawn { session_id });
            }
        });
    }
}

/// Folgt Login/Logout und hält die Erkennung eingehender Anrufe am Laufen
async fn watch_identity(inner: Weak<Inner>, mut identity: watch::Receiver<Option<Identity>>) {
    let mut active_user: Option<String> = None;

    loop {
        let current = identity
            .borrow_and_update()
            .as_ref()
            .map(|i| i.user_id.clone());

        if active_user.is_some() && active_user != current {
            let Some(coordinator) = upgrade(&inner) else {
                return;
            };
            coordinator.handle_signed_out().await;
        }
        active_user = current.clone();

        let keep_going = match current {
            Some(user_id) => watch_incoming_until_change(&inner, &user_id, &mut identity).await,
            None => identity.changed().await.is_ok(),
        };
        if !keep_going {
            return;
        }
    }
}

/// Läuft bis sich die Identität ändert (`true`) oder der Koordinator weg ist (`false`).
/// Schließt sich der Watch, wird nach `resubscribe_delay` neu abonniert.
async fn watch_incoming_until_change(
    inner: &Weak<Inner>,
    user_id: &str,
    identity: &mut watch::Receiver<Option<Identity>>,
) -> bool {
    loop {
        let Some(coordinator) = upgrade(inner) else {
            return false;
        };
        let channel = coordinator.inner.channel.clone();
        let delay = coordinator.inner.config.resubscribe_delay();
        drop(coordinator);

        match channel.watch_incoming(user_id).await {
            Ok(mut incoming) => {
                tracing::debug!("Watching incoming calls for {}", user_id);
                loop {
                    tokio::select! {
                        changed = identity.changed() => return changed.is_ok(),
                        batch = incoming.next() => {
                            let Some(sessions) = batch else {
                                tracing::warn!("Incoming call watch for {} closed", user_id);
                                break;
                            };
                            let Some(coordinator) = upgrade(inner) else {
                                return false;
                            };
                            coordinator.reconcile_incoming(user_id, sessions).await;
                        }
                    }
                }
            }
            Err(e) => tracing::warn!("Failed to watch incoming calls for {}: {}", user_id, e),
        }

        tokio::select! {
            changed = identity.changed() => return changed.is_ok(),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
