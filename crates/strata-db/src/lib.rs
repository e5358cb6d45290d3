//! Migration bookkeeping and execution.
//!
//! [`store`] discovers the ordered [`MigrationSet`] on disk, [`tracker`] keeps the
//! current [`Position`] inside the target database, [`engine`] moves between the
//! two through an [`Executor`], and [`scaffold`] creates new file pairs.

pub mod engine;
pub mod executor;
pub mod output;
pub mod scaffold;
pub mod step;
pub mod store;
pub mod tracker;

pub use engine::{
    CancelFlag, Engine, Operation, RunResult, StatusReport, StepOutcome, StepStatus,
};
pub use executor::{Executor, SqliteExecutor, Transition};
pub use scaffold::{Clock, ScaffoldedPair, Scaffolder, SystemClock};
pub use step::{Direction, MigrationSet, MigrationStep, Position, Sequence};
pub use tracker::PositionTracker;
