//! Ed25519 Key Pair für signierte Store-Requests
//!
//! Jeder Request an den Remote-Store wird signiert, damit das Relay
//! Schreibzugriffe einem Client zuordnen kann. Der Private Key liegt im
//! App-Datenverzeichnis oder an einem explizit übergebenen Pfad.
//!
//! ## Verwendung
//! ```no_run
//! use pulse_calls::crypto::KeyPair;
//!
//! let keypair = KeyPair::load_or_create(None).unwrap();
//! let signature = keypair.sign_message(&serde_json::json!({"type": "heartbeat"}));
//! assert!(KeyPair::verify_message(
//!     &keypair.public_key_base64(),
//!     &serde_json::json!({"type": "heartbeat"}),
//!     &signature
//! ));
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum KeyPairError {
    #[error("Failed to access key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode private key: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid private key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("Could not determine app data directory")]
    NoDataDirectory,
}

// ============================================================================
// KEYPAIR STRUCT
// ============================================================================

#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Lädt ein existierendes Schlüsselpaar oder erstellt ein neues.
    ///
    /// Ohne Pfad wird `<data_dir>/pulse-calls/keys/private.key` verwendet.
    pub fn load_or_create(path: Option<&Path>) -> Result<Self, KeyPairError> {
        let key_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_key_path()?,
        };

        if key_path.exists() {
            tracing::info!("Loading existing keypair from {:?}", key_path);
            Self::load_from_file(&key_path)
        } else {
            tracing::info!("Creating new keypair at {:?}", key_path);
            let keypair = Self::generate();
            keypair.save_to_file(&key_path)?;
            Ok(keypair)
        }
    }

    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    fn load_from_file(path: &Path) -> Result<Self, KeyPairError> {
        let encoded = fs::read_to_string(path)?;
        let bytes = BASE64.decode(encoded.trim())?;

        let key_bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyPairError::InvalidKeyLength(bytes.len()))?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    fn save_to_file(&self, path: &Path) -> Result<(), KeyPairError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, BASE64.encode(self.signing_key.to_bytes()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600); // Nur Owner kann lesen/schreiben
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    fn default_key_path() -> Result<PathBuf, KeyPairError> {
        let proj_dirs = directories::ProjectDirs::from("com", "pulse", "pulse-calls")
            .ok_or(KeyPairError::NoDataDirectory)?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("keys");
        path.push("private.key");
        Ok(path)
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn sign_base64(&self, message: &[u8]) -> String {
        BASE64.encode(self.sign(message).to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    /// Signiert ein JSON-Objekt.
    ///
    /// Die Signatur wird über den JSON-String aller Felder (außer `signature`)
    /// in alphabetischer Sortierung berechnet.
    pub fn sign_message(&self, payload: &Value) -> String {
        self.sign_base64(canonical_json(payload).as_bytes())
    }

    /// Prüft eine mit [`KeyPair::sign_message`] erstellte Signatur
    pub fn verify_message(public_key_base64: &str, payload: &Value, signature_base64: &str) -> bool {
        let Ok(key_bytes) = BASE64.decode(public_key_base64) else {
            return false;
        };
        let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = BASE64.decode(signature_base64) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&sig_bytes) else {
            return false;
        };

        verifying_key
            .verify(canonical_json(payload).as_bytes(), &signature)
            .is_ok()
    }
}

/// Alphabetisch sortiertes JSON ohne `signature`-Feld
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&sort_json_object(value)).unwrap_or_default()
}

fn sort_json_object(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().filter(|k| *k != "signature").collect();
            keys.sort();
            let mut sorted_map = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted_map.insert(key.clone(), sort_json_object(v));
                }
            }
            Value::Object(sorted_map)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_json_object).collect()),
        other => other.clone(),
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
