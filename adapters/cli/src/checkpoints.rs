use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use belief_nest_core::{HistoryEntry, Tick, TickMap};
use belief_nest_system_observation::checkpoint::{self, CheckpointFile, FileKind};
use belief_nest_system_record::{ObservationRecord, PositionMemory};
use serde::Serialize;
use tracing::{info, warn};

/// Content of the newest checkpoint of one record.
#[derive(Debug, Serialize)]
pub(crate) struct RecordSummary {
    record: String,
    states: Vec<Tick>,
    histories: Vec<Tick>,
    history_ticks: usize,
    first_tick: Option<Tick>,
    last_tick: Option<Tick>,
    blocks: usize,
    containers: usize,
    event_ticks: usize,
    agents: Vec<String>,
}

/// Outcome of replaying one history file.
#[derive(Debug, Serialize)]
pub(crate) struct VerifyStep {
    record: String,
    from: Tick,
    to: Tick,
    replayed_ticks: usize,
    pub(crate) matches: bool,
}

struct RecordFiles {
    label: String,
    agent: Option<String>,
    dir: PathBuf,
    prefix: String,
}

impl RecordFiles {
    fn objective(branch_dir: &Path) -> Self {
        Self {
            label: "objective".to_owned(),
            agent: None,
            dir: branch_dir.to_path_buf(),
            prefix: String::new(),
        }
    }

    fn subjective(branch_dir: &Path, agent: &str) -> Self {
        Self {
            label: agent.to_owned(),
            agent: Some(agent.to_owned()),
            dir: checkpoint::internal_dir(branch_dir),
            prefix: checkpoint::agent_prefix(agent),
        }
    }

    fn empty_record(&self, policy: PositionMemory) -> ObservationRecord {
        match &self.agent {
            Some(agent) => ObservationRecord::new_subjective(agent.clone(), policy),
            None => ObservationRecord::new_objective(policy),
        }
    }

    fn list(&self, kind: FileKind) -> anyhow::Result<Vec<CheckpointFile>> {
        checkpoint::list(&self.dir, &self.prefix, kind)
            .with_context(|| format!("failed to list {} checkpoints", self.label))
    }
}

/// Agents with a subjective record below `.internal/`.
fn agents(branch_dir: &Path) -> anyhow::Result<BTreeSet<String>> {
    let dir = checkpoint::internal_dir(branch_dir);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", dir.display())),
    };
    let mut agents = BTreeSet::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let name = entry.file_name();
        if let Some((agent, _)) = name.to_str().and_then(|name| name.split_once("#state#")) {
            let _ = agents.insert(agent.to_owned());
        }
    }
    Ok(agents)
}

fn records(branch_dir: &Path, agent: Option<&str>) -> anyhow::Result<Vec<RecordFiles>> {
    if let Some(agent) = agent {
        return Ok(vec![RecordFiles::subjective(branch_dir, agent)]);
    }
    let mut records = vec![RecordFiles::objective(branch_dir)];
    records.extend(
        agents(branch_dir)?
            .iter()
            .map(|agent| RecordFiles::subjective(branch_dir, agent)),
    );
    Ok(records)
}

/// Loads every record of a branch directory, or only the one of `agent`.
pub(crate) fn inspect(branch_dir: &Path, agent: Option<&str>) -> anyhow::Result<Vec<RecordSummary>> {
    let mut summaries = Vec::new();
    for files in records(branch_dir, agent)? {
        let mut record = files.empty_record(PositionMemory::default());
        let _ = checkpoint::load_record(&mut record, &files.dir, &files.prefix)
            .with_context(|| format!("failed to load the {} record", files.label))?;
        let memory = record.memory();
        summaries.push(RecordSummary {
            states: files.list(FileKind::State)?.iter().map(|file| file.tick).collect(),
            histories: files.list(FileKind::History)?.iter().map(|file| file.tick).collect(),
            history_ticks: record.history().len(),
            first_tick: record.history().first_tick(),
            last_tick: record.last_tick(),
            blocks: memory.blocks.len(),
            containers: memory.containers.len(),
            event_ticks: memory.events.len(),
            agents: memory.status.keys().cloned().collect(),
            record: files.label,
        });
    }
    Ok(summaries)
}

fn read(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn load_state(
    files: &RecordFiles,
    policy: PositionMemory,
    state: &CheckpointFile,
) -> anyhow::Result<ObservationRecord> {
    let mut record = files.empty_record(policy);
    record
        .import(&read(&state.path)?, None)
        .with_context(|| format!("corrupted state {}", state.path.display()))?;
    Ok(record)
}

/// Replays, for every record, each history file onto the state written
/// before it and compares the outcome with the state written with it.
pub(crate) fn verify(branch_dir: &Path, policy: PositionMemory) -> anyhow::Result<Vec<VerifyStep>> {
    let mut steps = Vec::new();
    for files in records(branch_dir, None)? {
        let states = files.list(FileKind::State)?;
        anyhow::ensure!(
            !states.is_empty() || files.agent.is_some(),
            "no checkpoint in {}",
            branch_dir.display()
        );
        for pair in states.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            let history_path = checkpoint::file_path(&files.dir, &files.prefix, FileKind::History, to.tick);
            if !history_path.is_file() {
                warn!(record = %files.label, tick = %to.tick, "state without history, not verified");
                continue;
            }
            let history: TickMap<HistoryEntry> = TickMap::merge_serialized(&[read(&history_path)?])
                .with_context(|| format!("corrupted history {}", history_path.display()))?;
            let expected = load_state(&files, policy, to)?;
            let roster: Vec<String> = expected.memory().status.keys().cloned().collect();

            let mut replayed = load_state(&files, policy, from)?;
            replayed
                .replay(&history, &roster)
                .with_context(|| format!("failed to replay {}", history_path.display()))?;
            let matches = replayed.memory() == expected.memory();
            if !matches {
                warn!(record = %files.label, from = %from.tick, to = %to.tick, "replay diverges");
            }
            steps.push(VerifyStep {
                record: files.label.clone(),
                from: from.tick,
                to: to.tick,
                replayed_ticks: history.len(),
                matches,
            });
        }
    }
    info!(steps = steps.len(), branch_dir = %branch_dir.display(), "verification finished");
    Ok(steps)
}
