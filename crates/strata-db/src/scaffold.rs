use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use strata_common::{Error, Result};
use tracing::{debug, info, warn};

use crate::step::Sequence;
use crate::store;

const MAX_ATTEMPTS: usize = 1000;

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// `YYYYMMDDHHMMSSmmm` as a sequence (17 digits, fits in `u64`).
pub fn timestamp_sequence(at: DateTime<Utc>) -> Sequence {
    let text = at.format("%Y%m%d%H%M%S%3f").to_string();
    // Always 17 ASCII digits for years 0..=9999.
    Sequence::parse(&text).unwrap_or_else(|| Sequence::new(at.timestamp_millis().max(0) as u64))
}

/// Smallest sequence that is at least `now` and above everything in `existing`.
pub fn next_sequence(existing: &BTreeSet<Sequence>, now: Sequence) -> Sequence {
    match existing.last() {
        Some(max) if *max >= now => max.next(),
        _ => now,
    }
}

/// Lowercase, collapse whitespace runs into `_`, drop anything outside `[a-z0-9_]`.
pub fn normalize_description(raw: &str) -> String {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join("_");
    let mut slug = String::with_capacity(joined.len());
    for c in joined.chars().map(|c| c.to_ascii_lowercase()) {
        if c.is_ascii_alphanumeric() || (c == '_' && !slug.ends_with('_')) {
            slug.push(c);
        }
    }
    slug.trim_matches('_').to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaffoldedPair {
    pub sequence: Sequence,
    pub up_path: PathBuf,
    pub down_path: PathBuf,
}

/// Creates empty up/down file pairs with fresh sequences.
pub struct Scaffolder<C: Clock = SystemClock> {
    folder: PathBuf,
    extension: String,
    clock: C,
}

impl Scaffolder<SystemClock> {
    pub fn new(folder: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self::with_clock(folder, extension, SystemClock)
    }
}

impl<C: Clock> Scaffolder<C> {
    pub fn with_clock(folder: impl Into<PathBuf>, extension: impl Into<String>, clock: C) -> Self {
        Self {
            folder: folder.into(),
            extension: extension.into(),
            clock,
        }
    }

    /// Write `<sequence>_<slug>.up.<ext>` and its `.down.` twin.
    ///
    /// Existing files are never overwritten: a taken name bumps the sequence. If
    /// the down file cannot be written the up file is removed again.
    pub fn create(&self, description: &str) -> Result<ScaffoldedPair> {
        let slug = normalize_description(description);
        if slug.is_empty() {
            return Err(Error::Other(format!(
                "description `{description}` has no usable characters"
            )));
        }

        let existing = store::scan_sequences(&self.folder, &self.extension)?;
        let mut sequence = next_sequence(&existing, timestamp_sequence(self.clock.now()));

        for _ in 0..MAX_ATTEMPTS {
            let up_path = self.path_for(sequence, &slug, "up");
            let down_path = self.path_for(sequence, &slug, "down");

            match create_new(&up_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("{} exists, bumping sequence", up_path.display());
                    sequence = sequence.next();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            if let Err(e) = create_new(&down_path) {
                discard_up_file(&up_path, &down_path, &e)?;
                if e.kind() == ErrorKind::AlreadyExists {
                    sequence = sequence.next();
                    continue;
                }
                return Err(e.into());
            }

            info!("created migration {sequence}_{slug}");
            return Ok(ScaffoldedPair {
                sequence,
                up_path,
                down_path,
            });
        }

        Err(Error::Other(format!(
            "could not find a free sequence in {} after {MAX_ATTEMPTS} attempts",
            self.folder.display()
        )))
    }

    fn path_for(&self, sequence: Sequence, slug: &str, direction: &str) -> PathBuf {
        self.folder
            .join(format!("{sequence}_{slug}.{direction}.{}", self.extension))
    }
}

fn create_new(path: &Path) -> std::io::Result<()> {
    OpenOptions::new().write(true).create_new(true).open(path)?;
    Ok(())
}

/// Remove the up half after its down twin failed. A leftover up file would be
/// a blank migration, so failing to remove it ends the attempt.
fn discard_up_file(up_path: &Path, down_path: &Path, cause: &std::io::Error) -> Result<()> {
    std::fs::remove_file(up_path).map_err(|e| {
        warn!("could not remove {} after failed scaffold", up_path.display());
        Error::Io(std::io::Error::new(
            e.kind(),
            format!(
                "failed to create {} ({cause}) and failed to remove {} ({e})",
                down_path.display(),
                up_path.display()
            ),
        ))
    })
}
