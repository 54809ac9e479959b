//! Pulse Calls - P2P Call Signaling
//!
//! Session-Management für Peer-to-Peer Audio/Video-Anrufe:
//! - Geteilter Dokumenten-Store als Rendezvous (In-Memory oder WebSocket-Relay)
//! - WebRTC für den Medien-Transport
//! - Ed25519-signierte Requests an das Relay
//! - SQLite für Profil-Cache und Anrufprotokoll
//!
//! ## Verwendung
//! ```no_run
//! use pulse_calls::{CallCoordinator, Identity, IdentityProvider, MediaKind, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), pulse_calls::CallError> {
//! pulse_calls::init_tracing();
//!
//! let identity = IdentityProvider::signed_in(Identity::new("alice"));
//! let coordinator = CallCoordinator::builder(Arc::new(MemoryStore::new()), identity).build();
//! coordinator.start();
//!
//! let session_id = coordinator.initiate_call("bob", MediaKind::Audio).await?;
//! println!("ringing: {}", session_id);
//! coordinator.end_call().await;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod config;
pub mod crypto;
pub mod database;
pub mod identity;
pub mod media;
pub mod peer;
pub mod profiles;
pub mod signaling;

pub use call::{
    CallCoordinator, CallCoordinatorBuilder, CallDirection, CallError, CallEvent, CallPhase,
    CallSnapshot, EndReason, IncomingCall,
};
pub use config::{CallConfig, ConfigError, IceServerConfig};
pub use crypto::KeyPair;
pub use database::{CallDatabase, CallRecord};
pub use identity::{Identity, IdentityProvider};
pub use signaling::{CallSession, CallStatus, MediaKind, MemoryStore, RemoteStore};

use tracing_subscriber::EnvFilter;

/// Installiert den globalen Logger (`RUST_LOG` plus Defaults).
///
/// Gibt `false` zurück, wenn bereits ein Subscriber installiert ist.
pub fn init_tracing() -> bool {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["pulse_calls=debug", "webrtc=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
