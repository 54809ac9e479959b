//! Lokale Datenbank
//!
//! SQLite-Datenbank für den Profil-Cache und das Anrufprotokoll.

mod call_log;
mod profiles;

pub use call_log::CallRecord;

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Could not determine app data directory")]
    NoDataDirectory,

    #[error("Not found: {0}")]
    NotFound(String),
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Datenbank (Thread-safe durch Mutex)
pub struct CallDatabase {
    conn: Mutex<Connection>,
}

impl CallDatabase {
    /// Öffnet oder erstellt die Datenbank. Ohne Pfad im App-Datenverzeichnis.
    pub fn open(path: Option<&Path>) -> Result<Self, DatabaseError> {
        let db_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_database_path()?,
        };

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening database at {:?}", db_path);

        let conn = Connection::open(&db_path)?;
        Self::from_connection(conn)
    }

    /// In-Memory Datenbank (Tests, flüchtige Sessions)
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DatabaseError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn default_database_path() -> Result<PathBuf, DatabaseError> {
        let proj_dirs = directories::ProjectDirs::from("com", "pulse", "pulse-calls")
            .ok_or(DatabaseError::NoDataDirectory)?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("calls.db");
        Ok(path)
    }

    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                user_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                photo_url TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS call_log (
                session_id TEXT PRIMARY KEY,
                peer_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                media_kind TEXT NOT NULL,
                outcome TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                connected_at INTEGER,
                ended_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        // Index für "neueste zuerst"
        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_call_log_ended_at ON call_log(ended_at)
            "#,
            [],
        )?;

        Ok(())
    }
}

#[cfg(test)]
impl CallDatabase {
    /// Führt `f` aus, während die Verbindung gesperrt ist
    pub(crate) fn with_locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _conn = self.conn.lock();
        f()
    }
}

impl std::fmt::Debug for CallDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallDatabase").finish_non_exhaustive()
    }
}
