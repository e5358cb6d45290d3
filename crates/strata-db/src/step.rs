use std::fmt;
use std::path::PathBuf;

use strata_common::{Error, Result};

/// Sortable identifier of a migration step, taken from the file name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sequence(u64);

impl Sequence {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Parse an all-digit string. Leading zeros are allowed, so `0007` and `7`
    /// name the same sequence.
    pub fn parse(text: &str) -> Option<Self> {
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        text.parse().ok().map(Self)
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence of the most recently applied step, or empty when nothing is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position(Option<Sequence>);

impl Position {
    pub const EMPTY: Position = Position(None);

    pub const fn at(sequence: Sequence) -> Self {
        Self(Some(sequence))
    }

    pub const fn sequence(self) -> Option<Sequence> {
        self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(seq) => write!(f, "{seq}"),
            None => f.write_str("empty"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One forward/reverse schema change, loaded from an up/down file pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStep {
    pub sequence: Sequence,
    pub description: String,
    pub up_body: String,
    /// Empty when the step cannot be rolled back.
    pub down_body: String,
    pub up_path: PathBuf,
    pub down_path: Option<PathBuf>,
}

impl MigrationStep {
    pub fn is_reversible(&self) -> bool {
        !self.down_body.trim().is_empty()
    }

    pub fn body(&self, direction: Direction) -> &str {
        match direction {
            Direction::Up => &self.up_body,
            Direction::Down => &self.down_body,
        }
    }

    /// `<sequence>_<description>`, the label used in output and errors.
    pub fn label(&self) -> String {
        format!("{}_{}", self.sequence, self.description)
    }
}

/// All discovered steps, strictly ascending by sequence.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    steps: Vec<MigrationStep>,
}

impl MigrationSet {
    /// Sort `steps` and reject duplicate sequences.
    pub fn new(mut steps: Vec<MigrationStep>) -> Result<Self> {
        steps.sort_by_key(|s| s.sequence);
        if let Some(pair) = steps.windows(2).find(|w| w[0].sequence == w[1].sequence) {
            return Err(Error::Discovery(format!(
                "duplicate sequence {} ({} and {})",
                pair[0].sequence,
                pair[0].up_path.display(),
                pair[1].up_path.display()
            )));
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn index_of(&self, sequence: Sequence) -> Option<usize> {
        self.steps
            .binary_search_by_key(&sequence, |s| s.sequence)
            .ok()
    }

    /// Index of the step `position` names, or `None` for the empty position.
    ///
    /// A position naming a sequence that is not on disk means the tracking record
    /// and the folder disagree; that is reported rather than repaired.
    pub fn locate(&self, position: Position) -> Result<Option<usize>> {
        match position.sequence() {
            None => Ok(None),
            Some(seq) => self.index_of(seq).map(Some).ok_or_else(|| {
                Error::Storage(format!(
                    "tracking record points at sequence {seq}, \
                     which is not in the migration folder"
                ))
            }),
        }
    }

    /// Number of steps at or below `position`.
    pub fn applied_count(&self, position: Position) -> usize {
        match position.sequence() {
            None => 0,
            Some(seq) => self.steps.partition_point(|s| s.sequence <= seq),
        }
    }

    /// Position left behind after reverting the step at `index`.
    pub fn position_before(&self, index: usize) -> Position {
        match index.checked_sub(1) {
            Some(prev) => Position::at(self.steps[prev].sequence),
            None => Position::EMPTY,
        }
    }
}
