//! Profile der Anrufer
//!
//! Eingehende Anrufe werden mit Name/Foto des Anrufers angezeigt. Profile
//! liegen im Store unter `users/{userId}` und werden lokal gecached, damit
//! bei Store-Fehlern wenigstens der zuletzt bekannte Name erscheint.

use crate::database::{CallDatabase, DatabaseError};
use crate::signaling::{DocPath, DocumentStore, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub const USERS_COLLECTION: &str = "users";

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Malformed profile {user_id}: {message}")]
    Malformed { user_id: String, message: String },

    #[error("Cache error: {0}")]
    Cache(#[from] DatabaseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync + 'static {
    async fn lookup(&self, user_id: &str) -> Result<Profile, ProfileError>;
}

/// Profile aus dem Store mit optionalem SQLite-Cache
pub struct StoreProfiles {
    store: Arc<dyn DocumentStore>,
    cache: Option<Arc<CallDatabase>>,
}

impl StoreProfiles {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store, cache: None }
    }

    pub fn with_cache(mut self, cache: Arc<CallDatabase>) -> Self {
        self.cache = Some(cache);
        self
    }

    async fn fetch(&self, user_id: &str) -> Result<Profile, ProfileError> {
        let path = DocPath::new(USERS_COLLECTION, user_id);
        let value = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| ProfileError::NotFound(user_id.to_string()))?;

        let mut profile: Profile =
            serde_json::from_value(value).map_err(|e| ProfileError::Malformed {
                user_id: user_id.to_string(),
                message: e.to_string(),
            })?;
        // Die Dokument-ID ist maßgeblich
        profile.user_id = user_id.to_string();
        Ok(profile)
    }
}

#[async_trait]
impl ProfileDirectory for StoreProfiles {
    async fn lookup(&self, user_id: &str) -> Result<Profile, ProfileError> {
        match self.fetch(user_id).await {
            Ok(profile) => {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.upsert_profile(&profile) {
                        tracing::warn!("Failed to cache profile {}: {}", user_id, e);
                    }
                }
                Ok(profile)
            }
            Err(ProfileError::Store(e)) => {
                let Some(cache) = &self.cache else {
                    return Err(ProfileError::Store(e));
                };
                tracing::warn!("Profile lookup for {} failed, using cache: {}", user_id, e);
                cache.get_profile(user_id).map_err(|cache_err| match cache_err {
                    DatabaseError::NotFound(_) => ProfileError::Store(e),
                    other => ProfileError::Cache(other),
                })
            }
            Err(other) => Err(other),
        }
    }
}

impl std::fmt::Debug for StoreProfiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreProfiles")
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
