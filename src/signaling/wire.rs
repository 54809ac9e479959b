//! Message Types für das Relay-Protokoll des Remote-Stores
//!
//! Client → Relay: signierte Requests mit `requestId`.
//! Relay → Client: Antworten (`ok` / `error`), Snapshots für Watches, `pong`.

use super::store::{DocPath, Query};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// CLIENT → RELAY MESSAGES
// ============================================================================

/// Alle Request-Arten
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreRequest {
    Get {
        path: DocPath,
    },
    Set {
        path: DocPath,
        data: Value,
    },
    Merge {
        path: DocPath,
        patch: Value,
    },
    Delete {
        path: DocPath,
    },
    Add {
        collection: String,
        data: Value,
    },
    Query {
        query: Query,
    },
    /// Watch-ID ist die Request-ID
    WatchDocument {
        path: DocPath,
    },
    WatchQuery {
        query: Query,
    },
    Unwatch {
        #[serde(rename = "watchId")]
        watch_id: String,
    },
    Heartbeat,
}

/// Umschlag mit Signatur-relevanten Metadaten
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(flatten)]
    pub request: StoreRequest,
    pub timestamp: i64,
    #[serde(default)]
    pub signature: String,
}

// ============================================================================
// RELAY → CLIENT MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Erfolgreiche Antwort
    Ok {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default)]
        result: Value,
    },

    /// Fehler (optional einem Request zugeordnet)
    Error {
        #[serde(rename = "requestId", default)]
        request_id: Option<String>,
        code: i32,
        message: String,
    },

    /// Neuer Stand eines Watches
    Snapshot {
        #[serde(rename = "watchId")]
        watch_id: String,
        data: Value,
    },

    /// Heartbeat Antwort
    Pong { timestamp: i64 },
}

/// Fehlercode für fehlende Dokumente
pub const CODE_NOT_FOUND: i32 = 404;

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_is_flat() {
        let envelope = RequestEnvelope {
            request_id: "r1".to_string(),
            client_id: "alice".to_string(),
            request: StoreRequest::Merge {
                path: DocPath::new("calls", "c1"),
                patch: json!({"status": "ended"}),
            },
            timestamp: 42,
            signature: String::new(),
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "merge");
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["path"]["collection"], "calls");
        assert_eq!(value["patch"]["status"], "ended");

        let back: RequestEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back.request, envelope.request);
    }

    #[test]
    fn test_parse_relay_messages() {
        let msg: RelayMessage =
            serde_json::from_str(r#"{"type":"error","requestId":"r9","code":404,"message":"gone"}"#)
                .unwrap();
        assert_eq!(
            msg,
            RelayMessage::Error {
                request_id: Some("r9".to_string()),
                code: CODE_NOT_FOUND,
                message: "gone".to_string()
            }
        );

        let msg: RelayMessage = serde_json::from_str(r#"{"type":"ok","requestId":"r1"}"#).unwrap();
        assert_eq!(
            msg,
            RelayMessage::Ok {
                request_id: "r1".to_string(),
                result: Value::Null
            }
        );
    }
}
