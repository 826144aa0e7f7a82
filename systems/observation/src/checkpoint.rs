//! Checkpoint files of a branch directory.
//!
//! A branch directory holds `state#T.json` and `history#T.json` for the
//! objective record and, below `.internal/`, `<agent>#state#T.json` and
//! `<agent>#history#T.json` for every subjective record. A history file
//! written at tick `T` holds the ticks after the previous history file up to
//! `T`; loading merges all of them onto the newest state.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use belief_nest_core::{Tick, INITIAL_TICK};
use belief_nest_system_record::ObservationRecord;
use regex::Regex;
use tracing::{debug, warn};

use crate::ObservationError;

/// Directory holding the subjective records.
pub const INTERNAL_DIR: &str = ".internal";

/// Content of a checkpoint file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// Memory snapshot.
    State,
    /// History fragment.
    History,
}

impl FileKind {
    const fn label(self) -> &'static str {
        match self {
            FileKind::State => "state",
            FileKind::History => "history",
        }
    }
}

/// A checkpoint file found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointFile {
    /// Content of the file.
    pub kind: FileKind,
    /// Tick the file was written at.
    pub tick: Tick,
    /// Location of the file.
    pub path: PathBuf,
}

/// Directory of the subjective records of a branch.
#[must_use]
pub fn internal_dir(branch_dir: &Path) -> PathBuf {
    branch_dir.join(INTERNAL_DIR)
}

/// File name prefix of an agent's subjective record.
#[must_use]
pub fn agent_prefix(agent: &str) -> String {
    format!("{agent}#")
}

/// Location of one checkpoint file of a record.
#[must_use]
pub fn file_path(dir: &Path, prefix: &str, kind: FileKind, tick: Tick) -> PathBuf {
    dir.join(file_name(prefix, kind, tick))
}

fn file_name(prefix: &str, kind: FileKind, tick: Tick) -> String {
    format!("{prefix}{}#{tick}.json", kind.label())
}

/// Checkpoint files of one record, sorted by tick. A missing directory has
/// none.
pub fn list(dir: &Path, prefix: &str, kind: FileKind) -> Result<Vec<CheckpointFile>, ObservationError> {
    let pattern = Regex::new(&format!(
        r"^{}{}#(-?\d+)\.json$",
        regex::escape(prefix),
        kind.label()
    ))?;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(ObservationError::io(dir, error)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|error| ObservationError::io(dir, error))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(tick) = pattern
            .captures(name)
            .and_then(|captures| captures.get(1))
            .and_then(|tick| tick.as_str().parse().ok())
        else {
            continue;
        };
        files.push(CheckpointFile {
            kind,
            tick: Tick::new(tick),
            path: entry.path(),
        });
    }
    files.sort_by_key(|file| file.tick);
    Ok(files)
}

/// Most recent checkpoint file of one record.
pub fn newest(dir: &Path, prefix: &str, kind: FileKind) -> Result<Option<CheckpointFile>, ObservationError> {
    Ok(list(dir, prefix, kind)?.pop())
}

fn read(path: &Path) -> Result<String, ObservationError> {
    fs::read_to_string(path).map_err(|error| ObservationError::io(path, error))
}

fn write(path: &Path, contents: &str) -> Result<(), ObservationError> {
    fs::write(path, contents).map_err(|error| ObservationError::io(path, error))
}

/// Writes the state of a record at `tick` and its history since the previous
/// history file.
///
/// Returns `false` without writing when a history file at or after `tick`
/// exists, unless `overwrite` is set, in which case the newest history file
/// is replaced.
pub fn dump_record(
    record: &ObservationRecord,
    dir: &Path,
    prefix: &str,
    tick: Tick,
    overwrite: bool,
) -> Result<bool, ObservationError> {
    let mut previous = newest(dir, prefix, FileKind::History)?;
    if let Some(file) = previous.as_ref().filter(|file| file.tick >= tick) {
        if !overwrite {
            warn!(prefix, tick = %tick, "checkpoint already exists, dump skipped");
            return Ok(false);
        }
        fs::remove_file(&file.path).map_err(|error| ObservationError::io(&file.path, error))?;
        previous = newest(dir, prefix, FileKind::History)?;
    }
    let start = previous.map_or(INITIAL_TICK, |file| file.tick).next();
    let snapshot = record.export(start)?;
    write(&file_path(dir, prefix, FileKind::State, tick), &snapshot.state)?;
    write(&file_path(dir, prefix, FileKind::History, tick), &snapshot.history)?;
    debug!(prefix, tick = %tick, start = %start, "checkpoint written");
    Ok(true)
}

/// Writes the state of a record that has no history yet.
pub fn dump_initial_state(
    record: &ObservationRecord,
    dir: &Path,
    prefix: &str,
) -> Result<(), ObservationError> {
    let snapshot = record.export(INITIAL_TICK)?;
    write(&file_path(dir, prefix, FileKind::State, INITIAL_TICK), &snapshot.state)
}

/// Reads the state file written at `tick`.
pub fn read_state(dir: &Path, prefix: &str, tick: Tick) -> Result<String, ObservationError> {
    read(&file_path(dir, prefix, FileKind::State, tick))
}

/// Restores a record from the newest state and every history file. Returns
/// the tick of the state.
pub fn load_record(
    record: &mut ObservationRecord,
    dir: &Path,
    prefix: &str,
) -> Result<Tick, ObservationError> {
    let state = newest(dir, prefix, FileKind::State)?
        .ok_or_else(|| ObservationError::MissingSnapshot(dir.join(format!("{prefix}state#*.json"))))?;
    let histories = list(dir, prefix, FileKind::History)?
        .iter()
        .map(|file| read(&file.path))
        .collect::<Result<Vec<_>, _>>()?;
    debug!(prefix, state = %state.tick, fragments = histories.len(), "loading checkpoint");
    record.import_fragments(&read(&state.path)?, &histories)?;
    Ok(state.tick)
}

/// Copies the checkpoint files of a branch, including the subjective ones,
/// into another directory. Directories of child worlds are left behind.
pub fn copy_branch(from: &Path, to: &Path) -> Result<(), ObservationError> {
    for (source, target) in [(from.to_path_buf(), to.to_path_buf()), (internal_dir(from), internal_dir(to))] {
        let entries = match fs::read_dir(&source) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
            Err(error) => return Err(ObservationError::io(source, error)),
        };
        fs::create_dir_all(&target).map_err(|error| ObservationError::io(&target, error))?;
        for entry in entries {
            let entry = entry.map_err(|error| ObservationError::io(&source, error))?;
            let is_file = entry
                .file_type()
                .map_err(|error| ObservationError::io(entry.path(), error))?
                .is_file();
            if !is_file {
                continue;
            }
            let destination = target.join(entry.file_name());
            let _ = fs::copy(entry.path(), &destination)
                .map_err(|error| ObservationError::io(&destination, error))?;
        }
    }
    Ok(())
}
