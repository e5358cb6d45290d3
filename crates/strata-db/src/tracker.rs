use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params};
use strata_common::{Error, Result};
use tracing::debug;

use crate::step::{Position, Sequence};

/// Reads and writes the single-row tracking table that holds the current [`Position`].
///
/// Methods take a `&Connection` so they can run inside a caller's transaction
/// (`rusqlite::Transaction` derefs to `Connection`).
#[derive(Debug, Clone)]
pub struct PositionTracker {
    table: String,
}

impl PositionTracker {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    fn quoted(&self) -> String {
        format!("\"{}\"", self.table.replace('"', "\"\""))
    }

    /// Create the tracking table and its row if absent. Idempotent.
    pub fn ensure(&self, conn: &Connection) -> Result<()> {
        let table = self.quoted();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                position TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            INSERT OR IGNORE INTO {table} (id, position) VALUES (1, NULL);"
        ))
        .map_err(|e| {
            Error::Storage(format!("failed to create tracking table {}: {e}", self.table))
        })?;
        Ok(())
    }

    fn exists(&self, conn: &Connection) -> Result<bool> {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [&self.table],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count > 0)
        .map_err(|e| Error::Storage(format!("failed to look up tracking table: {e}")))
    }

    /// Current position. A database that has never been migrated (no tracking
    /// table yet) reads as [`Position::EMPTY`] and is left untouched.
    pub fn current(&self, conn: &Connection) -> Result<Position> {
        if !self.exists(conn)? {
            debug!("tracking table {} not created yet", self.table);
            return Ok(Position::EMPTY);
        }
        let value: Option<Value> = conn
            .query_row(
                &format!("SELECT position FROM {} WHERE id = 1", self.quoted()),
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Storage(format!("failed to read tracking record: {e}")))?;

        let position = match value {
            None | Some(Value::Null) => Position::EMPTY,
            Some(Value::Text(text)) if text.is_empty() => Position::EMPTY,
            Some(Value::Text(text)) => Sequence::parse(&text)
                .map(Position::at)
                .ok_or_else(|| corrupt(&text))?,
            Some(Value::Integer(n)) => u64::try_from(n)
                .map(|n| Position::at(Sequence::new(n)))
                .map_err(|_| corrupt(&n.to_string()))?,
            Some(other) => return Err(corrupt(&format!("{other:?}"))),
        };
        debug!("tracking record {} at {position}", self.table);
        Ok(position)
    }

    pub fn advance(&self, conn: &Connection, sequence: Sequence) -> Result<()> {
        self.write(conn, Position::at(sequence))
    }

    pub fn retreat(&self, conn: &Connection, to: Position) -> Result<()> {
        self.write(conn, to)
    }

    fn write(&self, conn: &Connection, position: Position) -> Result<()> {
        let text = position.sequence().map(|s| s.to_string());
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {} SET position = ?1, updated_at = datetime('now') WHERE id = 1",
                    self.quoted()
                ),
                params![text],
            )
            .map_err(|e| Error::Storage(format!("failed to update tracking record: {e}")))?;
        if updated != 1 {
            return Err(Error::Storage(format!(
                "tracking record missing from {}",
                self.table
            )));
        }
        Ok(())
    }
}

fn corrupt(raw: &str) -> Error {
    Error::Storage(format!("tracking record is corrupt: `{raw}` is not a sequence"))
}
