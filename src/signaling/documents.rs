//! Call-Dokumente im Signaling-Store
//!
//! Diese Strukturen sind der Vertrag zwischen beiden Peers. Neue Felder
//! müssen optional sein (`#[serde(default)]`), unbekannte Felder werden
//! ignoriert, damit ältere und neuere Clients kompatibel bleiben.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Unbekannter Enum-Wert beim Parsen aus Text (z.B. aus SQLite)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown value: {0}")]
pub struct UnknownVariant(pub String);

// ============================================================================
// ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn wants_audio(&self) -> bool {
        true
    }

    pub fn wants_video(&self) -> bool {
        matches!(self, MediaKind::Video)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Status eines Call-Dokuments. `Ended` und `Rejected` sind terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Connected,
    Ended,
    Rejected,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
            CallStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Rejected)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

// ============================================================================
// SESSION DESCRIPTION & ICE
// ============================================================================

/// SDP Offer oder Answer (opaker Blob)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate im Browser-kompatiblen JSON-Format
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Eintrag in `calls/{id}/candidates`. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    #[serde(flatten)]
    pub candidate: IceCandidate,
    pub from: String,
}

impl IceCandidateRecord {
    pub fn new(candidate: IceCandidate, from: impl Into<String>) -> Self {
        Self {
            candidate,
            from: from.into(),
        }
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein Anruf, wie er im Signaling-Store liegt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: String,
    pub caller_id: String,
    pub target_id: String,
    pub media_kind: MediaKind,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// Unix-Millisekunden
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
}

impl CallSession {
    /// Neues klingelndes Dokument (noch ohne Offer)
    pub fn ringing(
        id: impl Into<String>,
        caller_id: impl Into<String>,
        target_id: impl Into<String>,
        media_kind: MediaKind,
        created_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            caller_id: caller_id.into(),
            target_id: target_id.into(),
            media_kind,
            status: CallStatus::Ringing,
            offer: None,
            answer: None,
            created_at,
            connected_at: None,
            ended_at: None,
        }
    }

    /// Klingelt länger als `ring_timeout_ms`?
    pub fn ring_expired(&self, now_ms: i64, ring_timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at) >= ring_timeout_ms as i64
    }

    /// Gesprächsdauer in Millisekunden (sofern verbunden)
    pub fn duration_ms(&self, now_ms: i64) -> Option<i64> {
        let start = self.connected_at?;
        let end = self.ended_at.unwrap_or(now_ms);
        Some(end.saturating_sub(start).max(0))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_serializes_camel_case() {
        let mut session = CallSession::ringing("c1", "alice", "bob", MediaKind::Video, 1_000);
        session.offer = Some(SessionDescription::offer("v=0"));

        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["callerId"], "alice");
        assert_eq!(value["targetId"], "bob");
        assert_eq!(value["mediaKind"], "video");
        assert_eq!(value["status"], "ringing");
        assert_eq!(value["offer"]["type"], "offer");
        assert_eq!(value["createdAt"], 1_000);
        assert!(value.get("answer").is_none());
        assert!(value.get("endedAt").is_none());
    }

    #[test]
    fn test_session_ignores_unknown_fields() {
        // Ein neuerer Client schreibt zusätzliche Felder
        let value = json!({
            "id": "c1",
            "callerId": "alice",
            "targetId": "bob",
            "mediaKind": "audio",
            "status": "connected",
            "createdAt": 5,
            "connectedAt": 9,
            "callerDevice": "tablet"
        });

        let session: CallSession = serde_json::from_value(value).unwrap();
        assert_eq!(session.status, CallStatus::Connected);
        assert_eq!(session.connected_at, Some(9));
        assert!(session.offer.is_none());
    }

    #[test]
    fn test_candidate_record_is_flat() {
        let record = IceCandidateRecord::new(
            IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
            "alice",
        );

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["from"], "alice");
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert!(value["candidate"].as_str().unwrap().starts_with("candidate:1"));

        let back: IceCandidateRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_ring_expiry_and_duration() {
        let mut session = CallSession::ringing("c1", "a", "b", MediaKind::Audio, 10_000);
        assert!(!session.ring_expired(69_999, 60_000));
        assert!(session.ring_expired(70_000, 60_000));

        assert_eq!(session.duration_ms(80_000), None);
        session.connected_at = Some(20_000);
        assert_eq!(session.duration_ms(25_000), Some(5_000));
        session.ended_at = Some(30_000);
        assert_eq!(session.duration_ms(99_000), Some(10_000));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Rejected.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Connected.is_terminal());
    }
}
