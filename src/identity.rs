//! Aktuelle Identität des Nutzers
//!
//! Der Koordinator liest die Identität beim Anrufen und abonniert
//! Login/Logout, um die Erkennung eingehender Anrufe zu steuern.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Geteilte Quelle der aktuellen Identität. Klone teilen denselben Zustand.
#[derive(Debug, Clone)]
pub struct IdentityProvider {
    tx: Arc<watch::Sender<Option<Identity>>>,
}

impl IdentityProvider {
    /// Startet abgemeldet
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn signed_in(identity: Identity) -> Self {
        let provider = Self::new();
        provider.sign_in(identity);
        provider
    }

    pub fn sign_in(&self, identity: Identity) {
        tracing::info!("Signed in as {}", identity.user_id);
        self.tx.send_replace(Some(identity));
    }

    pub fn sign_out(&self) {
        if self.tx.send_replace(None).is_some() {
            tracing::info!("Signed out");
        }
    }

    pub fn current(&self) -> Option<Identity> {
        self.tx.borrow().clone()
    }

    /// Empfänger für Login/Logout. Der aktuelle Wert gilt als gesehen.
    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.tx.subscribe()
    }
}

impl Default for IdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}
