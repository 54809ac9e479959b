//! WebSocket Client für einen Dokument-Relay
//!
//! Implementiert den [`DocumentStore`]-Vertrag über eine WebSocket-Verbindung:
//! - Signierte Requests mit Request-ID und Antwort-Korrelation
//! - Server-Push von Snapshots für Watches
//! - Heartbeat gegen Idle-Timeouts
//! - Bei Verbindungsverlust scheitern offene Requests, Watches enden

use super::store::{DocPath, DocumentSnapshot, DocumentStore, Query, StoreError, Subscription};
use super::wire::{RelayMessage, RequestEnvelope, StoreRequest, CODE_NOT_FOUND};
use crate::config::CallConfig;
use crate::crypto::KeyPair;
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use uuid::Uuid;

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone)]
pub struct RemoteStoreOptions {
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// Untergrenze für den Heartbeat. `tokio::time::interval` panikt bei null.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

impl RemoteStoreOptions {
    /// Heartbeat-Periode, nach unten auf `MIN_HEARTBEAT_INTERVAL` begrenzt
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL)
    }
}

impl Default for RemoteStoreOptions {
    fn default() -> Self {
        CallConfig::default().into()
    }
}

impl From<&CallConfig> for RemoteStoreOptions {
    fn from(config: &CallConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

impl From<CallConfig> for RemoteStoreOptions {
    fn from(config: CallConfig) -> Self {
        Self::from(&config)
    }
}

/// Leitet die WebSocket-URL aus einer http(s)/ws(s) Relay-URL ab
pub fn websocket_url(server_url: &str) -> Result<Url, StoreError> {
    let mut url =
        Url::parse(server_url).map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(StoreError::ConnectionFailed(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| StoreError::ConnectionFailed(format!("cannot use scheme {}", scheme)))?;

    if !url.path().ends_with("/ws") {
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    Ok(url)
}

// ============================================================================
// SHARED STATE
// ============================================================================

enum WatchSink {
    Document(mpsc::UnboundedSender<Option<Value>>),
    Query(mpsc::UnboundedSender<Vec<DocumentSnapshot>>),
}

type PendingMap = HashMap<String, oneshot::Sender<Result<Value, StoreError>>>;

struct Shared {
    client_id: String,
    keypair: Arc<KeyPair>,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    pending: Mutex<PendingMap>,
    watches: Mutex<HashMap<String, WatchSink>>,
    request_timeout: Duration,
}

impl Shared {
    /// Baut den signierten JSON-String eines Requests
    fn signed_message(&self, request_id: &str, request: StoreRequest) -> Result<String, StoreError> {
        let envelope = RequestEnvelope {
            request_id: request_id.to_string(),
            client_id: self.client_id.clone(),
            request,
            timestamp: Utc::now().timestamp_millis(),
            signature: String::new(),
        };

        let mut value = serde_json::to_value(&envelope)
            .map_err(|e| StoreError::SendFailed(e.to_string()))?;
        let signature = self.keypair.sign_message(&value);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("signature".to_string(), Value::String(signature));
        }

        serde_json::to_string(&value).map_err(|e| StoreError::SendFailed(e.to_string()))
    }

    /// Sendet ohne auf eine Antwort zu warten (non-blocking)
    fn send_sync(&self, request: StoreRequest) -> Result<(), StoreError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::NotConnected);
        }
        let msg = self.signed_message(&Uuid::new_v4().to_string(), request)?;
        self.tx
            .try_send(msg)
            .map_err(|e| StoreError::SendFailed(e.to_string()))
    }

    async fn request(&self, request: StoreRequest) -> Result<Value, StoreError> {
        self.request_with_id(Uuid::new_v4().to_string(), request).await
    }

    async fn request_with_id(
        &self,
        request_id: String,
        request: StoreRequest,
    ) -> Result<Value, StoreError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::NotConnected);
        }

        let msg = self.signed_message(&request_id, request)?;
        let (resp_tx, resp_rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), resp_tx);

        if let Err(e) = self.tx.send(msg).await {
            self.pending.lock().remove(&request_id);
            return Err(StoreError::SendFailed(e.to_string()));
        }

        match tokio::time::timeout(self.request_timeout, resp_rx).await {
            Ok(Ok(result)) => result,
            // Sender gedroppt: Verbindung wurde während des Requests getrennt
            Ok(Err(_)) => Err(StoreError::NotConnected),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                tracing::warn!("Store request {} timed out", request_id);
                Err(StoreError::Timeout)
            }
        }
    }

    /// Verarbeitet eingehende Relay-Nachrichten
    fn dispatch(&self, msg: RelayMessage) {
        match msg {
            RelayMessage::Ok { request_id, result } => {
                if let Some(tx) = self.pending.lock().remove(&request_id) {
                    let _ = tx.send(Ok(result));
                }
            }

            RelayMessage::Error {
                request_id,
                code,
                message,
            } => {
                let waiting = request_id.and_then(|id| self.pending.lock().remove(&id));
                match waiting {
                    Some(tx) => {
                        let err = if code == CODE_NOT_FOUND {
                            StoreError::NotFound(message)
                        } else {
                            StoreError::Remote { code, message }
                        };
                        let _ = tx.send(Err(err));
                    }
                    None => tracing::error!("Relay error {}: {}", code, message),
                }
            }

            RelayMessage::Snapshot { watch_id, data } => {
                let mut watches = self.watches.lock();
                let delivered = match watches.get(&watch_id) {
                    Some(WatchSink::Document(tx)) => {
                        let doc = if data.is_null() { None } else { Some(data) };
                        tx.send(doc).is_ok()
                    }
                    Some(WatchSink::Query(tx)) => {
                        match serde_json::from_value::<Vec<DocumentSnapshot>>(data) {
                            Ok(docs) => tx.send(docs).is_ok(),
                            Err(e) => {
                                tracing::warn!("Malformed query snapshot for {}: {}", watch_id, e);
                                true
                            }
                        }
                    }
                    None => {
                        tracing::debug!("Snapshot for unknown watch {}", watch_id);
                        true
                    }
                };
                if !delivered {
                    watches.remove(&watch_id);
                }
            }

            RelayMessage::Pong { .. } => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }

    fn on_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);

        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(StoreError::NotConnected));
        }
        // Drop der Sender beendet alle Subscriptions
        self.watches.lock().clear();
    }
}

// ============================================================================
// REMOTE STORE
// ============================================================================

/// [`DocumentStore`] über einen WebSocket-Relay
#[derive(Clone)]
pub struct RemoteStore {
    shared: Arc<Shared>,
}

impl RemoteStore {
    /// Verbindet mit dem Relay. `client_id` ist die Identität, unter der
    /// Requests signiert werden.
    pub async fn connect(
        server_url: &str,
        client_id: impl Into<String>,
        keypair: Arc<KeyPair>,
        options: RemoteStoreOptions,
    ) -> Result<Self, StoreError> {
        let ws_url = websocket_url(server_url)?;
        tracing::info!("Connecting to signaling store: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);

        let shared = Arc::new(Shared {
            client_id: client_id.into(),
            keypair,
            tx,
            connected: AtomicBool::new(true),
            pending: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            request_timeout: options.request_timeout,
        });

        // Read-Task
        let weak = Arc::downgrade(&shared);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let Some(shared) = weak.upgrade() else {
                            break;
                        };
                        match serde_json::from_str::<RelayMessage>(&text) {
                            Ok(msg) => shared.dispatch(msg),
                            Err(e) => tracing::warn!("Unparsable relay message: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            if let Some(shared) = weak.upgrade() {
                shared.on_disconnected();
            }
        });

        // Write-Task, endet wenn der Store gedroppt wird
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Heartbeat-Task
        let weak = Arc::downgrade(&shared);
        let heartbeat_interval = options.heartbeat_period();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if !shared.connected.load(Ordering::SeqCst) {
                    tracing::info!("Heartbeat: store disconnected, stopping heartbeat task");
                    break;
                }
                if let Err(e) = shared.send_sync(StoreRequest::Heartbeat) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });

        Ok(Self { shared })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Registriert eine Watch-Senke und gibt die passende Subscription zurück.
    /// Drop der Subscription schickt `unwatch` an den Relay.
    fn register_watch<T>(
        &self,
        watch_id: &str,
        rx: mpsc::UnboundedReceiver<T>,
        sink: WatchSink,
    ) -> Subscription<T> {
        self.shared.watches.lock().insert(watch_id.to_string(), sink);

        let weak = Arc::downgrade(&self.shared);
        let watch_id = watch_id.to_string();
        Subscription::with_cancel(rx, move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.watches.lock().remove(&watch_id).is_some() {
                if let Err(e) = shared.send_sync(StoreRequest::Unwatch { watch_id }) {
                    tracing::debug!("Unwatch not delivered: {}", e);
                }
            }
        })
    }
}

#[async_trait]
impl DocumentStore for RemoteStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        let value = self
            .shared
            .request(StoreRequest::Get { path: path.clone() })
            .await?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    async fn set(&self, path: &DocPath, data: Value) -> Result<(), StoreError> {
        self.shared
            .request(StoreRequest::Set {
                path: path.clone(),
                data,
            })
            .await
            .map(|_| ())
    }

    async fn merge(&self, path: &DocPath, patch: Value) -> Result<(), StoreError> {
        self.shared
            .request(StoreRequest::Merge {
                path: path.clone(),
                patch,
            })
            .await
            .map(|_| ())
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        self.shared
            .request(StoreRequest::Delete { path: path.clone() })
            .await
            .map(|_| ())
    }

    async fn add(&self, collection: &str, data: Value) -> Result<String, StoreError> {
        let result = self
            .shared
            .request(StoreRequest::Add {
                collection: collection.to_string(),
                data,
            })
            .await?;

        result
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Malformed {
                path: collection.to_string(),
                message: "add response without id".to_string(),
            })
    }

    async fn query(&self, query: &Query) -> Result<Vec<DocumentSnapshot>, StoreError> {
        let result = self
            .shared
            .request(StoreRequest::Query {
                query: query.clone(),
            })
            .await?;

        serde_json::from_value(result).map_err(|e| StoreError::Malformed {
            path: query.collection.clone(),
            message: e.to_string(),
        })
    }

    async fn watch_document(
        &self,
        path: &DocPath,
    ) -> Result<Subscription<Option<Value>>, StoreError> {
        let watch_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        // Senke vor dem Request registrieren, damit kein früher Snapshot verloren geht
        let subscription = self.register_watch(&watch_id, rx, WatchSink::Document(tx));

        self.shared
            .request_with_id(watch_id, StoreRequest::WatchDocument { path: path.clone() })
            .await?;
        Ok(subscription)
    }

    async fn watch_query(
        &self,
        query: &Query,
    ) -> Result<Subscription<Vec<DocumentSnapshot>>, StoreError> {
        let watch_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.register_watch(&watch_id, rx, WatchSink::Query(tx));

        self.shared
            .request_with_id(
                watch_id,
                StoreRequest::WatchQuery {
                    query: query.clone(),
                },
            )
            .await?;
        Ok(subscription)
    }
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("client_id", &self.shared.client_id)
            .field("connected", &self.is_connected())
            .field("watches", &self.shared.watches.lock().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
