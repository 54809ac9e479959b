//! Zustände und Events des Call-Koordinators

use crate::peer::RemoteTrack;
use crate::profiles::Profile;
use crate::signaling::{MediaKind, UnknownVariant};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Outbound => "outbound",
            CallDirection::Inbound => "inbound",
        }
    }
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallDirection {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outbound" => Ok(CallDirection::Outbound),
            "inbound" => Ok(CallDirection::Inbound),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

// ============================================================================
// END REASON
// ============================================================================

/// Warum ein Anruf beendet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Lokal aufgelegt
    LocalHangup,
    /// Gegenseite hat aufgelegt oder abgebrochen
    RemoteHangup,
    /// Angerufener hat abgelehnt
    Rejected,
    /// Klingel-Timeout ohne Antwort
    Timeout,
    /// Transport meldet `disconnected` / `failed`
    ConnectionLost,
    /// Aufbau ist nach dem Anlegen der Session gescheitert
    SetupFailed,
    SignedOut,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::LocalHangup => "local_hangup",
            EndReason::RemoteHangup => "remote_hangup",
            EndReason::Rejected => "rejected",
            EndReason::Timeout => "timeout",
            EndReason::ConnectionLost => "connection_lost",
            EndReason::SetupFailed => "setup_failed",
            EndReason::SignedOut => "signed_out",
        }
    }

    /// Kurzer Text für die UI
    pub fn user_message(&self) -> &'static str {
        match self {
            EndReason::LocalHangup => "Call ended",
            EndReason::RemoteHangup => "The other person ended the call",
            EndReason::Rejected => "Call declined",
            EndReason::Timeout => "No answer",
            EndReason::ConnectionLost => "Connection lost",
            EndReason::SetupFailed => "Call could not be connected",
            EndReason::SignedOut => "Call ended because you signed out",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndReason {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reason = match s {
            "local_hangup" => EndReason::LocalHangup,
            "remote_hangup" => EndReason::RemoteHangup,
            "rejected" => EndReason::Rejected,
            "timeout" => EndReason::Timeout,
            "connection_lost" => EndReason::ConnectionLost,
            "setup_failed" => EndReason::SetupFailed,
            "signed_out" => EndReason::SignedOut,
            other => return Err(UnknownVariant(other.to_string())),
        };
        Ok(reason)
    }
}

// ============================================================================
// CALL PHASE
// ============================================================================

/// Zustand des lokalen Anrufs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallPhase {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehend: wartet auf Answer. Eingehend: Answer wird aufgebaut.
    Ringing {
        session_id: String,
        peer_id: String,
        direction: CallDirection,
        media_kind: MediaKind,
    },
    /// Answer ist geschrieben bzw. angewendet
    Connected {
        session_id: String,
        peer_id: String,
        direction: CallDirection,
        media_kind: MediaKind,
        connected_at: i64,
    },
    Ended {
        session_id: String,
        reason: EndReason,
    },
    /// Ausgehender Anruf wurde abgelehnt
    Rejected { session_id: String },
}

impl CallPhase {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            CallPhase::Idle => None,
            CallPhase::Ringing { session_id, .. }
            | CallPhase::Connected { session_id, .. }
            | CallPhase::Ended { session_id, .. }
            | CallPhase::Rejected { session_id } => Some(session_id),
        }
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, CallPhase::Ringing { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, CallPhase::Connected { .. })
    }

    /// `Ringing` oder `Connected`
    pub fn is_active(&self) -> bool {
        self.is_ringing() || self.is_connected()
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::Ringing { .. } => "ringing",
            CallPhase::Connected { .. } => "connected",
            CallPhase::Ended { .. } => "ended",
            CallPhase::Rejected { .. } => "rejected",
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Ein klingelnder Anruf, der an uns adressiert ist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub session_id: String,
    pub caller_id: String,
    pub media_kind: MediaKind,
    pub created_at: i64,
    /// `None` wenn das Profil nicht geladen werden konnte
    pub caller_profile: Option<Profile>,
}

/// Events die vom CallCoordinator ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallPhase),
    IncomingCall(IncomingCall),
    /// Anrufer hat abgebrochen oder der Anruf wurde anderweitig beendet
    IncomingCallWithdrawn { session_id: String },
    RemoteTrack(RemoteTrack),
    Error(String),
}

/// Momentaufnahme für die UI
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub in_call: bool,
    pub has_local_stream: bool,
    /// Lokale Tracks, die noch nicht gestoppt wurden
    pub local_track_count: usize,
    pub remote_tracks: Vec<RemoteTrack>,
    pub muted: bool,
    pub video_enabled: bool,
    /// Gesprächsdauer seit `connectedAt`
    pub duration_ms: Option<i64>,
    pub pending_incoming: Vec<IncomingCall>,
}
