//! Plans and runs migration operations.
//!
//! Every operation re-reads the folder and the tracking record, computes the
//! steps to run, validates the whole plan, and then executes it one step at a
//! time. The first failure stops the run; the position always reflects exactly
//! the steps that committed.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use strata_common::{Error, Result};
use tracing::{info, warn};

use crate::executor::{Executor, Transition};
use crate::step::{Direction, MigrationSet, MigrationStep, Position, Sequence};
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    UpOne,
    UpAll,
    DownOne,
    DownAll,
    Refresh,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::UpOne => "up-one",
            Operation::UpAll => "up-all",
            Operation::DownOne => "down-one",
            Operation::DownAll => "down-all",
            Operation::Refresh => "refresh",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cancellation request, honoured between steps only.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Applied,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub sequence: Sequence,
    pub description: String,
    pub direction: Direction,
    pub status: StepStatus,
}

impl StepOutcome {
    pub fn is_applied(&self) -> bool {
        self.status == StepStatus::Applied
    }
}

/// What one operation did.
///
/// `before`/`after` are `None` only when the position could not be read.
#[derive(Debug)]
pub struct RunResult {
    pub operation: Operation,
    pub before: Option<Position>,
    pub after: Option<Position>,
    pub steps: Vec<StepOutcome>,
    pub error: Option<Error>,
}

impl RunResult {
    fn new(operation: Operation) -> Self {
        Self {
            operation,
            before: None,
            after: None,
            steps: Vec::new(),
            error: None,
        }
    }

    fn failed(mut self, error: Error) -> Self {
        self.error = Some(error);
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn applied(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.is_applied())
    }

    pub fn failed_step(&self) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| !s.is_applied())
    }
}

/// Read-only view of where the database stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub position: Position,
    /// Label of the step `position` names.
    pub current: Option<String>,
    pub applied: usize,
    pub pending: usize,
}

struct Planned {
    index: usize,
    direction: Direction,
}

pub struct Engine<E: Executor> {
    executor: E,
    folder: PathBuf,
    extension: String,
    cancel: CancelFlag,
}

impl<E: Executor> Engine<E> {
    pub fn new(executor: E, folder: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            folder: folder.into(),
            extension: "sql".to_string(),
            cancel: CancelFlag::new(),
        }
    }

    /// Only `<sequence>_<description>.(up|down).<extension>` files are migrations.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn run(&mut self, operation: Operation) -> RunResult {
        match operation {
            Operation::UpOne => self.up_one(),
            Operation::UpAll => self.up_all(),
            Operation::DownOne => self.down_one(),
            Operation::DownAll => self.down_all(),
            Operation::Refresh => self.refresh(),
        }
    }

    /// Apply the next pending step, if any.
    pub fn up_one(&mut self) -> RunResult {
        self.run_single(Operation::UpOne, |set, at| {
            plan_up(set, at).into_iter().take(1).collect()
        })
    }

    /// Apply every pending step in ascending order.
    pub fn up_all(&mut self) -> RunResult {
        self.run_single(Operation::UpAll, plan_up)
    }

    /// Revert the step the position names.
    pub fn down_one(&mut self) -> RunResult {
        self.run_single(Operation::DownOne, |_, at| {
            plan_down(at).into_iter().take(1).collect()
        })
    }

    /// Revert every applied step, newest first.
    pub fn down_all(&mut self) -> RunResult {
        self.run_single(Operation::DownAll, |_, at| plan_down(at))
    }

    /// Revert everything, then apply everything.
    ///
    /// If the rollback half fails the run stops there; the forward half is
    /// never started from a partially rolled-back database.
    pub fn refresh(&mut self) -> RunResult {
        let mut result = RunResult::new(Operation::Refresh);
        let (set, before) = match self.load() {
            Ok(loaded) => loaded,
            Err(e) => return result.failed(e),
        };
        result.before = Some(before);
        result.after = Some(before);

        let at = match set.locate(before) {
            Ok(at) => at,
            Err(e) => return result.failed(e),
        };
        let down = plan_down(at);
        let up = plan_up(&set, None);
        if let Err(e) = validate(&set, &down).and_then(|()| validate(&set, &up)) {
            return result.failed(e);
        }

        if let Err(e) = self.execute(&set, &down, &mut result) {
            warn!("refresh stopped during rollback: {e}");
            return result.failed(e);
        }
        if let Err(e) = self.execute(&set, &up, &mut result) {
            return result.failed(e);
        }
        result
    }

    /// Never writes: a database that was never migrated reports the empty
    /// position and gets no tracking table.
    pub fn status(&mut self) -> Result<StatusReport> {
        let set = self.discover()?;
        let position = self.executor.position()?;
        let current = set.locate(position)?.map(|i| set.steps()[i].label());
        let applied = set.applied_count(position);
        Ok(StatusReport {
            position,
            current,
            applied,
            pending: set.len() - applied,
        })
    }

    fn discover(&self) -> Result<MigrationSet> {
        store::list(&self.folder, &self.extension)
    }

    fn load(&mut self) -> Result<(MigrationSet, Position)> {
        let set = self.discover()?;
        self.executor.ensure_tracking()?;
        let position = self.executor.position()?;
        Ok((set, position))
    }

    fn run_single<F>(&mut self, operation: Operation, plan: F) -> RunResult
    where
        F: FnOnce(&MigrationSet, Option<usize>) -> Vec<Planned>,
    {
        let mut result = RunResult::new(operation);
        let (set, before) = match self.load() {
            Ok(loaded) => loaded,
            Err(e) => return result.failed(e),
        };
        result.before = Some(before);
        result.after = Some(before);

        let at = match set.locate(before) {
            Ok(at) => at,
            Err(e) => return result.failed(e),
        };
        let planned = plan(&set, at);
        if let Err(e) = validate(&set, &planned) {
            return result.failed(e);
        }
        if set.is_empty() {
            info!("{operation}: no migrations in {}", self.folder.display());
        } else if planned.is_empty() {
            info!("{operation}: nothing to do at position {before}");
        }
        if let Err(e) = self.execute(&set, &planned, &mut result) {
            return result.failed(e);
        }
        result
    }

    fn execute(
        &mut self,
        set: &MigrationSet,
        planned: &[Planned],
        result: &mut RunResult,
    ) -> Result<()> {
        let mut position = result.after.unwrap_or_default();

        for item in planned {
            let step = &set.steps()[item.index];
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled { next: step.label() });
            }

            let to = match item.direction {
                Direction::Up => Position::at(step.sequence),
                Direction::Down => set.position_before(item.index),
            };
            let transition = Transition {
                sequence: step.sequence,
                direction: item.direction,
                body: step.body(item.direction),
                from: position,
                to,
            };

            info!("migrating {} {}", item.direction, step.label());
            match self.executor.apply(&transition) {
                Ok(()) => {
                    position = to;
                    result.after = Some(to);
                    result.steps.push(outcome(step, item.direction, StepStatus::Applied));
                }
                Err(e) => {
                    warn!("{} {} failed: {e}", item.direction, step.label());
                    result.steps.push(outcome(
                        step,
                        item.direction,
                        StepStatus::Failed(e.to_string()),
                    ));
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

fn outcome(step: &MigrationStep, direction: Direction, status: StepStatus) -> StepOutcome {
    StepOutcome {
        sequence: step.sequence,
        description: step.description.clone(),
        direction,
        status,
    }
}

/// Steps after `at`, ascending.
fn plan_up(set: &MigrationSet, at: Option<usize>) -> Vec<Planned> {
    let start = at.map_or(0, |i| i + 1);
    (start..set.len())
        .map(|index| Planned {
            index,
            direction: Direction::Up,
        })
        .collect()
}

/// Steps up to and including `at`, descending.
fn plan_down(at: Option<usize>) -> Vec<Planned> {
    let end = at.map_or(0, |i| i + 1);
    (0..end)
        .rev()
        .map(|index| Planned {
            index,
            direction: Direction::Down,
        })
        .collect()
}

/// Reject the whole plan before anything runs.
fn validate(set: &MigrationSet, planned: &[Planned]) -> Result<()> {
    for item in planned {
        let step = &set.steps()[item.index];
        match item.direction {
            Direction::Up if step.up_body.trim().is_empty() => {
                return Err(Error::Discovery(format!(
                    "migration {} has an empty up file {}",
                    step.label(),
                    step.up_path.display()
                )));
            }
            Direction::Down if !step.is_reversible() => {
                return Err(Error::IrreversibleStep {
                    sequence: step.label(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::executor::SqliteExecutor;

    /// Requests cancellation as soon as one step has committed.
    struct CancelAfterFirst {
        inner: SqliteExecutor,
        cancel: CancelFlag,
    }

    impl Executor for CancelAfterFirst {
        fn dialect(&self) -> &'static str {
            self.inner.dialect()
        }

        fn ensure_tracking(&mut self) -> Result<()> {
            self.inner.ensure_tracking()
        }

        fn position(&mut self) -> Result<Position> {
            self.inner.position()
        }

        fn apply(&mut self, transition: &Transition<'_>) -> Result<()> {
            self.inner.apply(transition)?;
            self.cancel.cancel();
            Ok(())
        }
    }

    fn write_pair(dir: &Path, name: &str, up: &str, down: &str) {
        std::fs::write(dir.join(format!("{name}.up.sql")), up).unwrap();
        std::fs::write(dir.join(format!("{name}.down.sql")), down).unwrap();
    }

    fn engine(dir: &Path) -> Engine<SqliteExecutor> {
        Engine::new(SqliteExecutor::in_memory("migration").unwrap(), dir)
    }

    fn seqs(result: &RunResult) -> Vec<(u64, Direction)> {
        result
            .steps
            .iter()
            .map(|s| (s.sequence.value(), s.direction))
            .collect()
    }

    fn pos(n: u64) -> Option<Position> {
        Some(Position::at(Sequence::new(n)))
    }

    fn three_steps(dir: &Path) {
        write_pair(dir, "1_a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;");
        write_pair(dir, "2_b", "CREATE TABLE b (id INTEGER);", "DROP TABLE b;");
        write_pair(dir, "3_c", "CREATE TABLE c (id INTEGER);", "DROP TABLE c;");
    }

    #[test]
    fn up_one_applies_only_the_next_step() {
        let dir = tempfile::tempdir().unwrap();
        three_steps(dir.path());
        let mut engine = engine(dir.path());

        let result = engine.up_one();
        assert!(result.is_success());
        assert_eq!(seqs(&result), vec![(1, Direction::Up)]);
        assert_eq!(result.before, Some(Position::EMPTY));
        assert_eq!(result.after, pos(1));

        let result = engine.up_one();
        assert_eq!(seqs(&result), vec![(2, Direction::Up)]);
        assert_eq!(result.after, pos(2));
    }

    #[test]
    fn up_all_then_down_all_reverses_order() {
        let dir = tempfile::tempdir().unwrap();
        three_steps(dir.path());
        let mut engine = engine(dir.path());

        let up = engine.up_all();
        assert_eq!(
            seqs(&up),
            vec![(1, Direction::Up), (2, Direction::Up), (3, Direction::Up)]
        );
        assert_eq!(up.after, pos(3));

        let down = engine.down_all();
        assert_eq!(
            seqs(&down),
            vec![(3, Direction::Down), (2, Direction::Down), (1, Direction::Down)]
        );
        assert_eq!(down.after, Some(Position::EMPTY));
    }

    #[test]
    fn nothing_pending_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        three_steps(dir.path());
        let mut engine = engine(dir.path());
        engine.up_all();

        let again = engine.up_all();
        assert!(again.is_success());
        assert!(again.steps.is_empty());
        assert_eq!(again.before, again.after);

        assert!(engine.up_one().steps.is_empty());
    }

    #[test]
    fn down_one_at_empty_position_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        three_steps(dir.path());
        let result = engine(dir.path()).down_one();
        assert!(result.is_success());
        assert!(result.steps.is_empty());
    }

    #[test]
    fn failure_stops_the_run_and_keeps_prior_steps() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "1_a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;");
        write_pair(dir.path(), "2_bad", "CREATE TABLE oops (", "SELECT 1;");
        write_pair(dir.path(), "3_c", "CREATE TABLE c (id INTEGER);", "DROP TABLE c;");
        let mut engine = engine(dir.path());

        let result = engine.up_all();
        assert!(matches!(result.error, Some(Error::Execution { .. })));
        assert_eq!(result.after, pos(1));
        assert_eq!(result.applied().count(), 1);
        assert_eq!(result.failed_step().map(|s| s.sequence.value()), Some(2));
        assert_eq!(result.steps.len(), 2);
        assert_eq!(engine.status().unwrap().position, Position::at(Sequence::new(1)));
    }

    #[test]
    fn irreversible_step_blocks_down_before_execution() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "1_a", "CREATE TABLE a (id INTEGER);", "");
        write_pair(dir.path(), "2_b", "CREATE TABLE b (id INTEGER);", "DROP TABLE b;");
        let mut engine = engine(dir.path());
        engine.up_all();

        // down-all must fail without reverting step 2 first.
        let result = engine.down_all();
        assert!(matches!(result.error, Some(Error::IrreversibleStep { .. })));
        assert!(result.steps.is_empty());
        assert_eq!(result.after, pos(2));

        // down-one on the reversible head still works, then hits the guard.
        assert!(engine.down_one().is_success());
        let result = engine.down_one();
        assert!(matches!(result.error, Some(Error::IrreversibleStep { .. })));
        assert_eq!(result.after, pos(1));
    }

    #[test]
    fn empty_up_body_is_rejected_before_running() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "1_a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;");
        write_pair(dir.path(), "2_blank", "\n", "");
        let mut engine = engine(dir.path());

        let result = engine.up_all();
        assert!(matches!(result.error, Some(Error::Discovery(_))));
        assert!(result.steps.is_empty());
        assert_eq!(result.after, Some(Position::EMPTY));
    }

    #[test]
    fn refresh_restores_position() {
        let dir = tempfile::tempdir().unwrap();
        three_steps(dir.path());
        let mut engine = engine(dir.path());
        engine.up_all();

        let result = engine.refresh();
        assert!(result.is_success());
        assert_eq!(result.before, pos(3));
        assert_eq!(result.after, pos(3));
        assert_eq!(result.steps.len(), 6);
        assert_eq!(result.steps[0].direction, Direction::Down);
        assert_eq!(result.steps[5].direction, Direction::Up);
    }

    #[test]
    fn refresh_on_empty_folder_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let result = engine(dir.path()).refresh();
        assert!(result.is_success());
        assert!(result.steps.is_empty());
    }

    #[test]
    fn refresh_aborts_when_rollback_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "1_a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;");
        write_pair(dir.path(), "2_b", "CREATE TABLE b (id INTEGER);", "DROP TABLE missing;");
        let mut engine = engine(dir.path());
        engine.up_all();

        let result = engine.refresh();
        assert!(matches!(result.error, Some(Error::Execution { .. })));
        assert_eq!(seqs(&result), vec![(2, Direction::Down)]);
        assert_eq!(result.after, pos(2));
        assert!(result.steps.iter().all(|s| s.direction == Direction::Down));
    }

    #[test]
    fn unknown_position_is_reported_not_corrected() {
        let dir = tempfile::tempdir().unwrap();
        three_steps(dir.path());
        let mut engine = engine(dir.path());
        engine.up_all();
        std::fs::remove_file(dir.path().join("3_c.up.sql")).unwrap();
        std::fs::remove_file(dir.path().join("3_c.down.sql")).unwrap();

        let result = engine.down_one();
        assert!(matches!(result.error, Some(Error::Storage(_))));
        assert!(result.steps.is_empty());
        assert!(engine.status().is_err());
    }

    #[test]
    fn cancellation_is_checked_between_steps() {
        let dir = tempfile::tempdir().unwrap();
        three_steps(dir.path());
        let cancel = CancelFlag::new();
        let mut engine = engine(dir.path()).with_cancel_flag(cancel.clone());
        cancel.cancel();

        let result = engine.up_all();
        assert!(matches!(result.error, Some(Error::Cancelled { .. })));
        assert!(result.steps.is_empty());
        assert_eq!(result.after, Some(Position::EMPTY));
    }

    #[test]
    fn status_reports_current_step_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        three_steps(dir.path());
        let mut engine = engine(dir.path());

        let status = engine.status().unwrap();
        assert_eq!(status.current, None);
        assert_eq!((status.applied, status.pending), (0, 3));

        engine.up_one();
        engine.up_one();
        let status = engine.status().unwrap();
        assert_eq!(status.current.as_deref(), Some("2_b"));
        assert_eq!((status.applied, status.pending), (2, 1));
    }

    #[test]
    fn missing_folder_fails_with_discovery_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = engine(&dir.path().join("absent")).up_all();
        assert!(matches!(result.error, Some(Error::Discovery(_))));
        assert_eq!(result.before, None);
    }

    #[test]
    fn down_all_stops_at_the_first_failed_revert() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "1_a", "CREATE TABLE a (id INTEGER);", "DROP TABLE a;");
        write_pair(dir.path(), "2_b", "CREATE TABLE b (id INTEGER);", "DROP TABLE missing;");
        write_pair(dir.path(), "3_c", "CREATE TABLE c (id INTEGER);", "DROP TABLE c;");
        let mut engine = engine(dir.path());
        assert!(engine.up_all().is_success());

        let result = engine.down_all();
        assert!(matches!(result.error, Some(Error::Execution { .. })));
        assert_eq!(result.after, pos(2));
        assert_eq!(seqs(&result), vec![(3, Direction::Down), (2, Direction::Down)]);
        let reverted: Vec<u64> = result.applied().map(|s| s.sequence.value()).collect();
        assert_eq!(reverted, vec![3]);
        assert_eq!(result.failed_step().map(|s| s.sequence.value()), Some(2));
        assert_eq!(engine.status().unwrap().position, Position::at(Sequence::new(2)));
    }

    #[test]
    fn cancellation_mid_run_keeps_committed_steps() {
        let dir = tempfile::tempdir().unwrap();
        three_steps(dir.path());
        let cancel = CancelFlag::new();
        let executor = CancelAfterFirst {
            inner: SqliteExecutor::in_memory("migration").unwrap(),
            cancel: cancel.clone(),
        };
        let mut engine = Engine::new(executor, dir.path()).with_cancel_flag(cancel);

        let result = engine.up_all();
        assert!(matches!(result.error, Some(Error::Cancelled { ref next }) if next == "2_b"));
        assert_eq!(seqs(&result), vec![(1, Direction::Up)]);
        assert_eq!(result.applied().count(), 1);
        assert_eq!(result.after, pos(1));
        assert_eq!(engine.status().unwrap().position, Position::at(Sequence::new(1)));
    }

    #[test]
    fn status_on_untouched_database_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        three_steps(dir.path());
        let mut engine = engine(dir.path());

        let status = engine.status().unwrap();
        assert_eq!(status.position, Position::EMPTY);
        assert_eq!(status.pending, 3);
        let tables: i64 = engine
            .executor()
            .connection()
            .query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn only_the_configured_extension_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        three_steps(dir.path());
        std::fs::write(dir.path().join("4_d.up.pgsql"), "NOT SQLITE AT ALL").unwrap();
        let mut engine = engine(dir.path());
        assert!(engine.up_all().is_success());
        assert_eq!(engine.status().unwrap().position, Position::at(Sequence::new(3)));

        let mut engine = Engine::new(SqliteExecutor::in_memory("migration").unwrap(), dir.path())
            .with_extension("pgsql");
        assert_eq!(engine.status().unwrap().pending, 1);
    }
}
