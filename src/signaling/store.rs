//! Document Store Contract
//!
//! Minimaler Vertrag, den der Call-Kern von einer geteilten Dokument-Datenbank
//! braucht: Punkt-Lesen/-Schreiben, Merge, Löschen und Live-Queries mit
//! Gleichheits-Filtern. Zustellung an Subscriber ist at-least-once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Connection to signaling store failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling store")]
    NotConnected,

    #[error("Request timed out")]
    Timeout,

    #[error("Malformed document {path}: {message}")]
    Malformed { path: String, message: String },

    #[error("Failed to send request: {0}")]
    SendFailed(String),

    #[error("Store error {code}: {message}")]
    Remote { code: i32, message: String },
}

// ============================================================================
// PATHS & QUERIES
// ============================================================================

/// Adresse eines einzelnen Dokuments
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocPath {
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

/// Query über eine Collection mit UND-verknüpften Gleichheits-Filtern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Prüft ob ein Dokument alle Filter erfüllt
    pub fn matches(&self, data: &Value) -> bool {
        self.filters
            .iter()
            .all(|f| data.get(&f.field) == Some(&f.value))
    }
}

/// Ein Dokument aus einem Query-Ergebnis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub id: String,
    pub data: Value,
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Live-Subscription auf ein Dokument oder eine Query.
///
/// Drop beendet die Subscription.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx, on_drop: None }
    }

    /// Subscription mit Cleanup-Callback (z.B. Unwatch beim Remote-Store)
    pub fn with_cancel(rx: mpsc::UnboundedReceiver<T>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(cancel)),
        }
    }

    /// Wartet auf den nächsten Snapshot. `None` wenn die Quelle geschlossen ist.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(cancel) = self.on_drop.take() {
            cancel();
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("cancel_on_drop", &self.on_drop.is_some())
            .finish()
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Liest ein Dokument (`None` wenn nicht vorhanden)
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, StoreError>;

    /// Schreibt ein Dokument vollständig (erstellt oder überschreibt)
    async fn set(&self, path: &DocPath, data: Value) -> Result<(), StoreError>;

    /// Merged Top-Level-Felder in ein bestehendes Dokument
    async fn merge(&self, path: &DocPath, patch: Value) -> Result<(), StoreError>;

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError>;

    /// Legt ein Dokument mit vom Store vergebener ID an
    async fn add(&self, collection: &str, data: Value) -> Result<String, StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<DocumentSnapshot>, StoreError>;

    async fn watch_document(&self, path: &DocPath)
        -> Result<Subscription<Option<Value>>, StoreError>;

    async fn watch_query(&self, query: &Query)
        -> Result<Subscription<Vec<DocumentSnapshot>>, StoreError>;
}

// ============================================================================
// TESTS
// ============================================================================
