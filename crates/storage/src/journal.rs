//! SQLite journal implementation.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::{Error, Result};

/// One journaled event.
#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub data: serde_json::Value,
}

/// Raw journal row — used for type-safe deserialization.
#[derive(Debug, Deserialize)]
struct EntryRow {
    id: String,
    timestamp: String,
    kind: String,
    data: String,
}

/// SQLite-backed event journal.
pub struct Journal {
    conn: Connection,
}

impl Journal {
    /// Open or create a journal at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let journal = Self { conn };
        journal.init_schema()?;
        Ok(journal)
    }

    /// Create an in-memory journal (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let journal = Self { conn };
        journal.init_schema()?;
        Ok(journal)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind
                ON events(kind, timestamp);
            "#,
        )?;
        Ok(())
    }

    /// Append one event.
    pub fn append(&self, kind: &str, data: &impl Serialize) -> Result<()> {
        self.conn.execute(
            "INSERT INTO events (id, timestamp, kind, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                Utc::now().to_rfc3339(),
                kind,
                serde_json::to_string(data)?,
            ],
        )?;
        Ok(())
    }

    /// The most recent entries, newest first, optionally filtered by kind.
    pub fn recent(&self, limit: usize, kind: Option<&str>) -> Result<Vec<JournalEntry>> {
        let entries = match kind {
            Some(kind) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, timestamp, kind, data FROM events
                     WHERE kind = ?1 ORDER BY timestamp DESC LIMIT ?2",
                )?;
                let rows = stmt.query_and_then(params![kind, limit as i64], |row| {
                    serde_rusqlite::from_row::<EntryRow>(row).map_err(Error::from)
                })?;
                collect_rows(rows)?
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, timestamp, kind, data FROM events
                     ORDER BY timestamp DESC LIMIT ?1",
                )?;
                let rows = stmt.query_and_then(params![limit as i64], |row| {
                    serde_rusqlite::from_row::<EntryRow>(row).map_err(Error::from)
                })?;
                collect_rows(rows)?
            }
        };
        Ok(entries)
    }

    /// Total number of journaled events.
    pub fn len(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn collect_rows(
    rows: impl Iterator<Item = std::result::Result<EntryRow, Error>>,
) -> Result<Vec<JournalEntry>> {
    let mut entries = Vec::new();
    for row in rows {
        entries.push(parse_row(row?)?);
    }
    Ok(entries)
}

fn parse_row(row: EntryRow) -> Result<JournalEntry> {
    let id = row
        .id
        .parse::<Uuid>()
        .map_err(|e| Error::Decode(e.to_string()))?;
    let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
        .map_err(|e| Error::Decode(e.to_string()))?
        .with_timezone(&Utc);
    let data = serde_json::from_str(&row.data)?;
    Ok(JournalEntry {
        id,
        timestamp,
        kind: row.kind,
        data,
    })
}
