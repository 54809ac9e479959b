//! Konfiguration
//!
//! Defaults + Überschreibung per Umgebungsvariablen:
//! - `SIGNALING_URL`: Relay-URL für den Remote-Store
//! - `CALL_RING_TIMEOUT_MS`: Klingel-Timeout
//! - `CALL_STUN_URLS`: kommagetrennte STUN-URLs
//! - `CALL_TURN_URL`, `CALL_TURN_USERNAME`, `CALL_TURN_CREDENTIAL`: optionaler TURN-Server

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("{0} requires CALL_TURN_USERNAME and CALL_TURN_CREDENTIAL")]
    IncompleteTurn(String),
}

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Google STUN Server (kostenlos, für die meisten NATs ausreichend)
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Nach dieser Zeit ohne Antwort beendet der Anrufer den Call selbst
    pub ring_timeout_ms: u64,
    pub ice_servers: Vec<IceServerConfig>,
    pub signaling_url: Option<String>,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Wartezeit bevor eine abgebrochene Incoming-Subscription neu aufgebaut wird
    pub resubscribe_delay_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_ms: 60_000,
            ice_servers: default_ice_servers(),
            signaling_url: None,
            request_timeout_ms: 10_000,
            // Relay-Proxies schließen idle WebSockets, daher regelmäßig Heartbeats
            heartbeat_interval_ms: 25_000,
            resubscribe_delay_ms: 2_000,
        }
    }
}

impl CallConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    /// Defaults mit Überschreibungen aus der Prozess-Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Wie [`CallConfig::from_env`], aber mit beliebiger Variablen-Quelle
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.signaling_url = Some(url);
        }

        if let Some(raw) = lookup("CALL_RING_TIMEOUT_MS") {
            config.ring_timeout_ms = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: "CALL_RING_TIMEOUT_MS".to_string(),
                value: raw.clone(),
            })?;
        }

        if let Some(raw) = lookup("CALL_STUN_URLS") {
            let urls: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            config.ice_servers = if urls.is_empty() {
                Vec::new()
            } else {
                vec![IceServerConfig {
                    urls,
                    username: String::new(),
                    credential: String::new(),
                }]
            };
        }

        if let Some(url) = lookup("CALL_TURN_URL") {
            match (lookup("CALL_TURN_USERNAME"), lookup("CALL_TURN_CREDENTIAL")) {
                (Some(username), Some(credential)) => config.ice_servers.push(IceServerConfig {
                    urls: vec![url],
                    username,
                    credential,
                }),
                _ => return Err(ConfigError::IncompleteTurn(url)),
            }
        }

        Ok(config)
    }
}

// ============================================================================
// TESTS
// ============================================================================
