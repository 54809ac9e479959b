//! In-Memory Document Store
//!
//! Prozess-lokale Implementierung des [`DocumentStore`]-Vertrags. Wird für
//! Tests und für lokale Setups (zwei Clients im selben Prozess) verwendet.

use super::store::{DocPath, DocumentSnapshot, DocumentStore, Query, StoreError, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

struct DocWatcher {
    path: DocPath,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

struct QueryWatcher {
    query: Query,
    tx: mpsc::UnboundedSender<Vec<DocumentSnapshot>>,
}

#[derive(Default)]
struct MemoryInner {
    collections: HashMap<String, BTreeMap<String, Value>>,
    doc_watchers: Vec<DocWatcher>,
    query_watchers: Vec<QueryWatcher>,
    next_id: u64,
}

impl MemoryInner {
    fn read(&self, path: &DocPath) -> Option<Value> {
        self.collections
            .get(&path.collection)
            .and_then(|docs| docs.get(&path.id))
            .cloned()
    }

    fn evaluate(&self, query: &Query) -> Vec<DocumentSnapshot> {
        self.collections
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, data)| query.matches(data))
                    .map(|(id, data)| DocumentSnapshot {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Benachrichtigt alle Watcher, die von einer Änderung an `path` betroffen sind
    fn notify(&mut self, path: &DocPath) {
        self.doc_watchers.retain(|w| !w.tx.is_closed());
        self.query_watchers.retain(|w| !w.tx.is_closed());

        let current = self.read(path);
        for watcher in self.doc_watchers.iter().filter(|w| &w.path == path) {
            let _ = watcher.tx.send(current.clone());
        }

        for watcher in self
            .query_watchers
            .iter()
            .filter(|w| w.query.collection == path.collection)
        {
            let _ = watcher.tx.send(self.evaluate(&watcher.query));
        }
    }
}

/// Geteilter In-Memory Store (Clone teilt denselben Zustand)
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stellt den aktuellen Stand eines Dokuments erneut an alle Watcher zu.
    ///
    /// Simuliert doppelte Zustellung, wie sie echte Stores liefern können.
    pub fn redeliver(&self, path: &DocPath) {
        self.inner.lock().notify(path);
    }

    /// Anzahl der Dokumente in einer Collection
    pub fn len(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .collections
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    /// Synchrones Lesen ohne Umweg über den async Vertrag
    pub fn read(&self, path: &DocPath) -> Option<Value> {
        self.inner.lock().read(path)
    }

    /// Anzahl aktiver Watcher (Dokument + Query)
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.doc_watchers.retain(|w| !w.tx.is_closed());
        inner.query_watchers.retain(|w| !w.tx.is_closed());
        inner.doc_watchers.len() + inner.query_watchers.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        Ok(self.inner.lock().read(path))
    }

    async fn set(&self, path: &DocPath, data: Value) -> Result<(), StoreError> {
        if !data.is_object() {
            return Err(StoreError::Malformed {
                path: path.to_string(),
                message: "document must be a JSON object".to_string(),
            });
        }

        let mut inner = self.inner.lock();
        inner
            .collections
            .entry(path.collection.clone())
            .or_default()
            .insert(path.id.clone(), data);
        inner.notify(path);
        Ok(())
    }

    async fn merge(&self, path: &DocPath, patch: Value) -> Result<(), StoreError> {
        let Value::Object(fields) = patch else {
            return Err(StoreError::Malformed {
                path: path.to_string(),
                message: "patch must be a JSON object".to_string(),
            });
        };

        let mut inner = self.inner.lock();
        let doc = inner
            .collections
            .get_mut(&path.collection)
            .and_then(|docs| docs.get_mut(&path.id))
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        let Some(target) = doc.as_object_mut() else {
            return Err(StoreError::Malformed {
                path: path.to_string(),
                message: "stored document is not an object".to_string(),
            });
        };
        for (key, value) in fields {
            target.insert(key, value);
        }

        inner.notify(path);
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let removed = inner
            .collections
            .get_mut(&path.collection)
            .and_then(|docs| docs.remove(&path.id));

        if removed.is_some() {
            inner.notify(path);
        }
        Ok(())
    }

    async fn add(&self, collection: &str, data: Value) -> Result<String, StoreError> {
        let id = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            format!("{:012}", inner.next_id)
        };
        self.set(&DocPath::new(collection, id.clone()), data).await?;
        Ok(id)
    }

    async fn query(&self, query: &Query) -> Result<Vec<DocumentSnapshot>, StoreError> {
        Ok(self.inner.lock().evaluate(query))
    }

    async fn watch_document(
        &self,
        path: &DocPath,
    ) -> Result<Subscription<Option<Value>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let _ = tx.send(inner.read(path));
        inner.doc_watchers.push(DocWatcher {
            path: path.clone(),
            tx,
        });
        Ok(Subscription::new(rx))
    }

    async fn watch_query(
        &self,
        query: &Query,
    ) -> Result<Subscription<Vec<DocumentSnapshot>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let _ = tx.send(inner.evaluate(query));
        inner.query_watchers.push(QueryWatcher {
            query: query.clone(),
            tx,
        });
        Ok(Subscription::new(rx))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryStore")
            .field("collections", &inner.collections.len())
            .field("doc_watchers", &inner.doc_watchers.len())
            .field("query_watchers", &inner.query_watchers.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
