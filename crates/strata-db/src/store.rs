//! Discovery of migration file pairs on disk.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use strata_common::{Error, Result};
use tracing::{debug, warn};

use crate::step::{Direction, MigrationSet, MigrationStep, Sequence};

/// The parts of a `<sequence>_<description>.<up|down>.<ext>` file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFileName {
    pub sequence: Sequence,
    pub description: String,
    pub direction: Direction,
    pub extension: String,
}

impl MigrationFileName {
    /// `Ok(None)` when `name` is not shaped like a migration file. A name that
    /// is shaped like one but carries a sequence too large to order is an error,
    /// so the step is never silently skipped.
    pub fn parse(name: &str) -> Result<Option<Self>> {
        let mut parts = name.rsplitn(3, '.');
        let (Some(extension), Some(direction), Some(stem)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Ok(None);
        };
        let direction = match direction {
            "up" => Direction::Up,
            "down" => Direction::Down,
            _ => return Ok(None),
        };
        let Some((seq, description)) = stem.split_once('_') else {
            return Ok(None);
        };
        if extension.is_empty()
            || description.is_empty()
            || seq.is_empty()
            || !seq.bytes().all(|b| b.is_ascii_digit())
        {
            return Ok(None);
        }
        let sequence = Sequence::parse(seq).ok_or_else(|| {
            Error::Discovery(format!(
                "{name}: sequence {seq} is out of range (largest is {})",
                u64::MAX
            ))
        })?;
        Ok(Some(Self {
            sequence,
            description: description.to_string(),
            direction,
            extension: extension.to_string(),
        }))
    }
}

struct Half {
    description: String,
    body: String,
    path: PathBuf,
}

#[derive(Default)]
struct Pair {
    up: Option<Half>,
    down: Option<Half>,
}

/// Read every `.<extension>` migration pair in `folder` (non-recursive) into an
/// ordered set.
pub fn list(folder: &Path, extension: &str) -> Result<MigrationSet> {
    let mut pairs: BTreeMap<Sequence, Pair> = BTreeMap::new();

    for (parsed, path) in migration_files(folder, extension)? {
        let body = std::fs::read_to_string(&path).map_err(|e| {
            Error::Discovery(format!("failed to read {}: {e}", path.display()))
        })?;
        let pair = pairs.entry(parsed.sequence).or_default();
        let slot = match parsed.direction {
            Direction::Up => &mut pair.up,
            Direction::Down => &mut pair.down,
        };

        if let Some(existing) = slot.as_ref() {
            if existing.body != body {
                return Err(Error::Discovery(format!(
                    "sequence {} has conflicting {} files: {} and {}",
                    parsed.sequence,
                    parsed.direction,
                    existing.path.display(),
                    path.display()
                )));
            }
            warn!(
                "{} duplicates {}; using the first",
                path.display(),
                existing.path.display()
            );
            continue;
        }
        *slot = Some(Half {
            description: parsed.description,
            body,
            path,
        });
    }

    let mut steps = Vec::with_capacity(pairs.len());
    for (sequence, pair) in pairs {
        let Some(up) = pair.up else {
            let down = pair.down.map(|d| d.path.display().to_string());
            return Err(Error::Discovery(format!(
                "sequence {sequence} has a down file but no up file ({})",
                down.unwrap_or_default()
            )));
        };
        if let Some(down) = &pair.down {
            if down.description != up.description {
                return Err(Error::Discovery(format!(
                    "sequence {sequence} up and down files disagree on description: \
                     `{}` vs `{}`",
                    up.description, down.description
                )));
            }
        }
        let (down_body, down_path) = match pair.down {
            Some(d) => (d.body, Some(d.path)),
            None => (String::new(), None),
        };
        steps.push(MigrationStep {
            sequence,
            description: up.description,
            up_body: up.body,
            down_body,
            up_path: up.path,
            down_path,
        });
    }

    debug!("discovered {} migration(s) in {}", steps.len(), folder.display());
    MigrationSet::new(steps)
}

/// Sequences already used in `folder`, read from file names only.
///
/// Unlike [`list`] this does not read bodies or validate pairing, so a
/// half-edited folder can still receive a new pair.
pub fn scan_sequences(folder: &Path, extension: &str) -> Result<BTreeSet<Sequence>> {
    Ok(migration_files(folder, extension)?
        .into_iter()
        .map(|(parsed, _)| parsed.sequence)
        .collect())
}

/// Migration-shaped files in `folder` whose extension is `extension`.
fn migration_files(folder: &Path, extension: &str) -> Result<Vec<(MigrationFileName, PathBuf)>> {
    let suffix = format!(".{extension}");
    let mut out = Vec::new();
    for (name, path) in entries(folder)? {
        if !name.ends_with(&suffix) {
            debug!("ignoring {}: extension is not {suffix}", path.display());
            continue;
        }
        let Some(parsed) = MigrationFileName::parse(&name)? else {
            warn!("ignoring {}: not a migration file name", path.display());
            continue;
        };
        out.push((parsed, path));
    }
    Ok(out)
}

/// Regular, non-hidden files in `folder`, sorted by name.
fn entries(folder: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !folder.is_dir() {
        return Err(Error::Discovery(format!(
            "migration folder {} does not exist",
            folder.display()
        )));
    }

    let read = std::fs::read_dir(folder).map_err(|e| {
        Error::Discovery(format!("failed to read {}: {e}", folder.display()))
    })?;

    let mut out = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| {
            Error::Discovery(format!("failed to read directory entry: {e}"))
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
        else {
            warn!("ignoring {}: file name is not UTF-8", path.display());
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        out.push((name, path));
    }
    out.sort();
    Ok(out)
}
