use crate::media::MediaAccessError;
use crate::peer::TransportError;
use crate::signaling::StoreError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Media access failed: {0}")]
    MediaAccess(#[from] MediaAccessError),

    #[error("Call session not found: {0}")]
    SessionNotFound(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] StoreError),

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Call {0} is already being answered")]
    AlreadyAnswering(String),

    #[error("Call {0} has already been answered")]
    AlreadyAnswered(String),

    #[error("A call to {0} is already ringing")]
    DuplicateCall(String),

    #[error("Call {0} is not addressed to you")]
    NotAddressedToYou(String),

    #[error("Call {0} is no longer ringing")]
    NotRinging(String),

    #[error("Call {0} has no offer yet")]
    OfferMissing(String),

    #[error("Invalid call target: {0}")]
    InvalidTarget(String),

    /// Der Aufbau wurde durch `end_call` oder einen neuen Zustand überholt
    #[error("Call setup was cancelled")]
    Cancelled,
}

impl CallError {
    /// Kurzer Text für Toasts
    pub fn user_message(&self) -> &'static str {
        match self {
            CallError::NotAuthenticated => "Please sign in to make calls",
            CallError::MediaAccess(MediaAccessError::PermissionDenied) => {
                "Microphone or camera access was denied"
            }
            CallError::MediaAccess(_) => "Microphone or camera is not available",
            CallError::SessionNotFound(_) | CallError::NotRinging(_) => {
                "This call is no longer available"
            }
            CallError::Transport(_) => "Connection failed",
            CallError::Signaling(_) => "Could not reach the call service",
            CallError::AlreadyInCall => "You are already in a call",
            CallError::AlreadyAnswering(_) | CallError::AlreadyAnswered(_) => {
                "This call has already been answered"
            }
            CallError::DuplicateCall(_) => "You are already calling this person",
            CallError::NotAddressedToYou(_) | CallError::InvalidTarget(_) => {
                "This call cannot be placed"
            }
            CallError::OfferMissing(_) => "The call is still being set up, try again",
            CallError::Cancelled => "Call cancelled",
        }
    }
}
