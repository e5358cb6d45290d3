use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};
use strata_common::{Error, Result};
use tracing::{debug, info};

use crate::step::{Direction, Position, Sequence};
use crate::tracker::PositionTracker;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One step's body together with the position change it implies.
#[derive(Debug, Clone, Copy)]
pub struct Transition<'a> {
    pub sequence: Sequence,
    pub direction: Direction,
    pub body: &'a str,
    /// Position the engine believes is current.
    pub from: Position,
    /// Position to record once the body has committed.
    pub to: Position,
}

/// A database dialect the engine can drive.
///
/// Implementations own the tracking record and must serialize each
/// [`Executor::apply`] against other processes: the position read, the body and the
/// position write happen under one lock, and a position that no longer equals
/// `transition.from` fails with [`Error::ConcurrentModification`].
pub trait Executor {
    fn dialect(&self) -> &'static str;

    /// Create the tracking record if it does not exist yet.
    fn ensure_tracking(&mut self) -> Result<()>;

    /// Current position, read without creating anything. A database without a
    /// tracking record is at [`Position::EMPTY`].
    fn position(&mut self) -> Result<Position>;

    /// Run `transition.body` and record `transition.to`.
    ///
    /// Body failures surface as [`Error::Execution`]; the position is left as it was.
    fn apply(&mut self, transition: &Transition<'_>) -> Result<()>;
}

/// SQLite executor. Each step runs in a `BEGIN IMMEDIATE` transaction, which
/// takes the database write lock before the tracking record is read, so a step
/// and its position update commit together or not at all.
///
/// Step bodies must not issue their own `BEGIN`/`COMMIT`. The database's
/// journal mode is left as the application configured it.
pub struct SqliteExecutor {
    conn: Connection,
    tracker: PositionTracker,
}

impl SqliteExecutor {
    pub fn open(db_path: &Path, table: &str) -> Result<Self> {
        info!("opening database at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Storage(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Storage(format!("failed to set pragmas: {e}")))?;

        Self::from_connection(conn, table)
    }

    pub fn in_memory(table: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Storage(format!("failed to set pragmas: {e}")))?;

        Self::from_connection(conn, table)
    }

    pub fn from_connection(conn: Connection, table: &str) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Storage(format!("failed to set busy timeout: {e}")))?;
        Ok(Self {
            conn,
            tracker: PositionTracker::new(table),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Executor for SqliteExecutor {
    fn dialect(&self) -> &'static str {
        "sqlite"
    }

    fn ensure_tracking(&mut self) -> Result<()> {
        self.tracker.ensure(&self.conn)
    }

    fn position(&mut self) -> Result<Position> {
        self.tracker.current(&self.conn)
    }

    fn apply(&mut self, transition: &Transition<'_>) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Storage(format!("failed to lock tracking record: {e}")))?;

        let found = self.tracker.current(&tx)?;
        if found != transition.from {
            // Dropping `tx` rolls back.
            return Err(Error::ConcurrentModification {
                expected: transition.from.to_string(),
                found: found.to_string(),
            });
        }

        debug!(
            "executing {} body of {} ({} bytes)",
            transition.direction,
            transition.sequence,
            transition.body.len()
        );
        tx.execute_batch(transition.body)
            .map_err(|e| Error::Execution {
                sequence: transition.sequence.to_string(),
                message: e.to_string(),
            })?;

        match transition.direction {
            Direction::Up => self.tracker.advance(&tx, transition.sequence)?,
            Direction::Down => self.tracker.retreat(&tx, transition.to)?,
        }

        tx.commit().map_err(|e| {
            Error::Storage(format!(
                "failed to commit migration {}: {e}",
                transition.sequence
            ))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> SqliteExecutor {
        let mut exec = SqliteExecutor::in_memory("migration").unwrap();
        exec.ensure_tracking().unwrap();
        exec
    }

    fn up(seq: u64, from: Position, body: &str) -> Transition<'_> {
        Transition {
            sequence: Sequence::new(seq),
            direction: Direction::Up,
            body,
            from,
            to: Position::at(Sequence::new(seq)),
        }
    }

    fn table_exists(exec: &SqliteExecutor, name: &str) -> bool {
        exec.connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get::<_, i64>(0),
            )
            .unwrap()
            == 1
    }

    #[test]
    fn apply_runs_body_and_advances() {
        let mut exec = executor();
        exec.apply(&up(1, Position::EMPTY, "CREATE TABLE users (id INTEGER);"))
            .unwrap();

        assert!(table_exists(&exec, "users"));
        assert_eq!(exec.position().unwrap(), Position::at(Sequence::new(1)));
    }

    #[test]
    fn failed_body_leaves_position_and_schema_untouched() {
        let mut exec = executor();
        let err = exec
            .apply(&up(
                1,
                Position::EMPTY,
                "CREATE TABLE partial (id INTEGER); THIS IS NOT SQL;",
            ))
            .unwrap_err();

        assert!(matches!(err, Error::Execution { .. }));
        assert_eq!(exec.position().unwrap(), Position::EMPTY);
        assert!(!table_exists(&exec, "partial"));
    }

    #[test]
    fn stale_from_position_is_a_concurrent_modification() {
        let mut exec = executor();
        exec.apply(&up(1, Position::EMPTY, "CREATE TABLE a (id INTEGER);"))
            .unwrap();

        // Another runner would still believe the position is empty.
        let err = exec
            .apply(&up(1, Position::EMPTY, "CREATE TABLE a (id INTEGER);"))
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrentModification { .. }));
        assert_eq!(exec.position().unwrap(), Position::at(Sequence::new(1)));
    }

    #[test]
    fn down_transition_retreats() {
        let mut exec = executor();
        exec.apply(&up(1, Position::EMPTY, "CREATE TABLE a (id INTEGER);"))
            .unwrap();
        exec.apply(&Transition {
            sequence: Sequence::new(1),
            direction: Direction::Down,
            body: "DROP TABLE a;",
            from: Position::at(Sequence::new(1)),
            to: Position::EMPTY,
        })
        .unwrap();

        assert!(!table_exists(&exec, "a"));
        assert_eq!(exec.position().unwrap(), Position::EMPTY);
    }
}
