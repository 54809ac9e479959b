//! Anrufprotokoll

use super::{CallDatabase, DatabaseError};
use crate::call::{CallDirection, EndReason};
use crate::signaling::MediaKind;
use rusqlite::types::Type;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Ein beendeter Anruf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub session_id: String,
    pub peer_id: String,
    pub direction: CallDirection,
    pub media_kind: MediaKind,
    pub outcome: EndReason,
    /// Unix-Millisekunden
    pub created_at: i64,
    pub connected_at: Option<i64>,
    pub ended_at: i64,
}

impl CallRecord {
    /// Gesprächsdauer, falls der Anruf verbunden war
    pub fn duration_ms(&self) -> Option<i64> {
        self.connected_at
            .map(|start| self.ended_at.saturating_sub(start).max(0))
    }
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CallRecord> {
    Ok(CallRecord {
        session_id: row.get(0)?,
        peer_id: row.get(1)?,
        direction: parse_column(row, 2)?,
        media_kind: parse_column(row, 3)?,
        outcome: parse_column(row, 4)?,
        created_at: row.get(5)?,
        connected_at: row.get(6)?,
        ended_at: row.get(7)?,
    })
}

impl CallDatabase {
    /// Protokolliert einen Anruf. Ein erneuter Eintrag für dieselbe Session überschreibt.
    pub fn record_call(&self, record: &CallRecord) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO call_log
                (session_id, peer_id, direction, media_kind, outcome, created_at, connected_at, ended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(session_id) DO UPDATE SET
                outcome = excluded.outcome,
                connected_at = COALESCE(excluded.connected_at, connected_at),
                ended_at = excluded.ended_at
            "#,
            params![
                record.session_id,
                record.peer_id,
                record.direction.as_str(),
                record.media_kind.as_str(),
                record.outcome.as_str(),
                record.created_at,
                record.connected_at,
                record.ended_at,
            ],
        )?;
        Ok(())
    }

    /// Neueste Anrufe zuerst
    pub fn recent_calls(&self, limit: usize) -> Result<Vec<CallRecord>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, peer_id, direction, media_kind, outcome, created_at, connected_at, ended_at
            FROM call_log
            ORDER BY ended_at DESC, created_at DESC
            LIMIT ?1
            "#,
        )?;

        let records = stmt
            .query_map(params![limit as i64], record_from_row)?
            .collect::<rusqlite::Result<Vec<CallRecord>>>()?;

        Ok(records)
    }
}
