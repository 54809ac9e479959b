//! Signaling Module - Call-Dokumente in einem geteilten Store
//!
//! Dieses Modul verwaltet die Rendezvous-Daten zwischen zwei Peers:
//! - Store-Vertrag mit Live-Subscriptions ([`DocumentStore`])
//! - In-Memory Store für Tests und lokale Setups
//! - WebSocket Remote-Store mit signierten Requests
//! - Typisierte Call-Operationen ([`SignalingChannel`])
//!

mod channel;
mod documents;
mod memory;
mod remote;
mod store;
mod wire;

pub use channel::{
    candidates_collection, CandidateWatch, IncomingWatch, SessionWatch, SignalingChannel,
    CALLS_COLLECTION,
};
pub use documents::*;
pub use memory::MemoryStore;
pub use remote::{websocket_url, RemoteStore, RemoteStoreOptions};
pub use store::{
    DocPath, DocumentSnapshot, DocumentStore, FieldFilter, Query, StoreError, Subscription,
};
pub use wire::{RelayMessage, RequestEnvelope, StoreRequest, CODE_NOT_FOUND};
