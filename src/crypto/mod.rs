//! Crypto Module - Ed25519 Request-Signierung
//!
//! Verwaltet die kryptographische Identität des Clients gegenüber dem
//! Remote-Store:
//! - Generierung eines Ed25519 Schlüsselpaars beim ersten Start
//! - Persistente Speicherung des Private Keys
//! - Signierung und Verifikation von JSON-Requests
//!

mod keypair;

pub use keypair::{KeyPair, KeyPairError};
