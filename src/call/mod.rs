//! Call Module - Anrufzustand und Koordination
//!
//! Der [`CallCoordinator`] verbindet:
//! - Media-Zugriff ([`crate::media`])
//! - Peer Connection ([`crate::peer`])
//! - Signaling über den Dokumenten-Store ([`crate::signaling`])
//!
//! Pro Koordinator gibt es höchstens einen aktiven Anruf.

mod context;
mod coordinator;
mod error;
mod state;
mod tasks;

#[cfg(test)]
mod tests;

pub use coordinator::{CallCoordinator, CallCoordinatorBuilder};
pub use error::CallError;
pub use state::{CallDirection, CallEvent, CallPhase, CallSnapshot, EndReason, IncomingCall};
