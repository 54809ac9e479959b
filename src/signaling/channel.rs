//! Signaling Channel
//!
//! Typisierte Call-Operationen auf einem beliebigen [`DocumentStore`].
//! Kennt die Collection-Struktur (`calls`, `calls/{id}/candidates`) und
//! übersetzt zwischen JSON-Dokumenten und [`CallSession`] /
//! [`IceCandidateRecord`].

use super::documents::{CallSession, CallStatus, IceCandidateRecord, SessionDescription};
use super::store::{DocPath, DocumentSnapshot, DocumentStore, Query, StoreError, Subscription};
use serde_json::{json, Value};
use std::sync::Arc;

pub const CALLS_COLLECTION: &str = "calls";

/// Pfad der Candidate-Subcollection einer Session
pub fn candidates_collection(session_id: &str) -> String {
    format!("{}/{}/candidates", CALLS_COLLECTION, session_id)
}

fn session_path(session_id: &str) -> DocPath {
    DocPath::new(CALLS_COLLECTION, session_id)
}

fn parse_session(path: &str, value: Value) -> Result<CallSession, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Malformed {
        path: path.to_string(),
        message: e.to_string(),
    })
}

fn to_value<T: serde::Serialize>(path: &str, doc: &T) -> Result<Value, StoreError> {
    serde_json::to_value(doc).map_err(|e| StoreError::Malformed {
        path: path.to_string(),
        message: e.to_string(),
    })
}

// ============================================================================
// SIGNALING CHANNEL
// ============================================================================

#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn DocumentStore>,
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Legt ein neues Call-Dokument an
    pub async fn create_session(&self, session: &CallSession) -> Result<(), StoreError> {
        let path = session_path(&session.id);
        let value = to_value(&path.to_string(), session)?;
        self.store.set(&path, value).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<CallSession>, StoreError> {
        let path = session_path(session_id);
        match self.store.get(&path).await? {
            Some(value) => parse_session(&path.to_string(), value).map(Some),
            None => Ok(None),
        }
    }

    /// Schreibt das Offer des Anrufers
    pub async fn write_offer(
        &self,
        session_id: &str,
        offer: &SessionDescription,
    ) -> Result<(), StoreError> {
        let path = session_path(session_id);
        let offer = to_value(&path.to_string(), offer)?;
        self.store.merge(&path, json!({ "offer": offer })).await
    }

    /// Schreibt Answer und `status=connected` in einem Merge
    pub async fn write_answer(
        &self,
        session_id: &str,
        answer: &SessionDescription,
        connected_at: i64,
    ) -> Result<(), StoreError> {
        let path = session_path(session_id);
        let answer = to_value(&path.to_string(), answer)?;
        self.store
            .merge(
                &path,
                json!({
                    "answer": answer,
                    "status": CallStatus::Connected,
                    "connectedAt": connected_at,
                }),
            )
            .await
    }

    /// Setzt einen terminalen Status mit End-Zeitstempel
    pub async fn mark_finished(
        &self,
        session_id: &str,
        status: CallStatus,
        ended_at: i64,
    ) -> Result<(), StoreError> {
        debug_assert!(status.is_terminal());
        self.store
            .merge(
                &session_path(session_id),
                json!({ "status": status, "endedAt": ended_at }),
            )
            .await
    }

    /// Entfernt das Call-Dokument. Beide Seiten werten das als Auflegen.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.store.delete(&session_path(session_id)).await
    }

    /// Hängt einen lokalen ICE Candidate an die Subcollection an
    pub async fn add_candidate(
        &self,
        session_id: &str,
        record: &IceCandidateRecord,
    ) -> Result<String, StoreError> {
        let collection = candidates_collection(session_id);
        let value = to_value(&collection, record)?;
        self.store.add(&collection, value).await
    }

    /// Klingelnde Sessions eines Anrufer/Ziel-Paars
    pub async fn ringing_between(
        &self,
        caller_id: &str,
        target_id: &str,
    ) -> Result<Vec<CallSession>, StoreError> {
        let query = Query::collection(CALLS_COLLECTION)
            .where_eq("callerId", caller_id)
            .where_eq("targetId", target_id)
            .where_eq("status", CallStatus::Ringing.as_str());

        let docs = self.store.query(&query).await?;
        Ok(parse_sessions(docs))
    }

    pub async fn watch_session(&self, session_id: &str) -> Result<SessionWatch, StoreError> {
        let path = session_path(session_id);
        let inner = self.store.watch_document(&path).await?;
        Ok(SessionWatch {
            path: path.to_string(),
            inner,
        })
    }

    pub async fn watch_candidates(&self, session_id: &str) -> Result<CandidateWatch, StoreError> {
        let collection = candidates_collection(session_id);
        let inner = self.store.watch_query(&Query::collection(&collection)).await?;
        Ok(CandidateWatch { collection, inner })
    }

    /// Alle klingelnden Sessions, die an `user_id` adressiert sind
    pub async fn watch_incoming(&self, user_id: &str) -> Result<IncomingWatch, StoreError> {
        let query = Query::collection(CALLS_COLLECTION)
            .where_eq("targetId", user_id)
            .where_eq("status", CallStatus::Ringing.as_str());
        let inner = self.store.watch_query(&query).await?;
        Ok(IncomingWatch { inner })
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel").finish_non_exhaustive()
    }
}

/// Parst Query-Ergebnisse, kaputte Dokumente werden geloggt und übersprungen
fn parse_sessions(docs: Vec<DocumentSnapshot>) -> Vec<CallSession> {
    docs.into_iter()
        .filter_map(|doc| {
            let path = format!("{}/{}", CALLS_COLLECTION, doc.id);
            match parse_session(&path, doc.data) {
                Ok(session) => Some(session),
                Err(e) => {
                    tracing::warn!("Skipping malformed call document: {}", e);
                    None
                }
            }
        })
        .collect()
}

// ============================================================================
// TYPED WATCHES
// ============================================================================

/// Änderungen an einem Call-Dokument
pub struct SessionWatch {
    path: String,
    inner: Subscription<Option<Value>>,
}

impl SessionWatch {
    /// `Some(None)` bedeutet: Dokument wurde gelöscht. `None`: Quelle geschlossen.
    /// Nicht parsebare Snapshots werden übersprungen.
    pub async fn next(&mut self) -> Option<Option<CallSession>> {
        loop {
            match self.inner.next().await? {
                None => return Some(None),
                Some(value) => match parse_session(&self.path, value) {
                    Ok(session) => return Some(Some(session)),
                    Err(e) => tracing::warn!("Ignoring malformed session snapshot: {}", e),
                },
            }
        }
    }
}

/// Candidate-Subcollection einer Session, liefert `(doc_id, record)`-Paare
pub struct CandidateWatch {
    collection: String,
    inner: Subscription<Vec<DocumentSnapshot>>,
}

impl CandidateWatch {
    pub async fn next(&mut self) -> Option<Vec<(String, IceCandidateRecord)>> {
        let docs = self.inner.next().await?;
        let records: Vec<(String, IceCandidateRecord)> = docs
            .into_iter()
            .filter_map(|doc| match serde_json::from_value::<IceCandidateRecord>(doc.data) {
                Ok(record) => Some((doc.id, record)),
                Err(e) => {
                    tracing::warn!(
                        "Ignoring malformed candidate {}/{}: {}",
                        self.collection,
                        doc.id,
                        e
                    );
                    None
                }
            })
            .collect();
        Some(records)
    }
}

/// Eingehende klingelnde Anrufe
pub struct IncomingWatch {
    inner: Subscription<Vec<DocumentSnapshot>>,
}

impl IncomingWatch {
    pub async fn next(&mut self) -> Option<Vec<CallSession>> {
        let docs = self.inner.next().await?;
        Some(parse_sessions(docs))
    }
}

// ============================================================================
// TESTS
// ============================================================================
