#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Tick-indexed observation records.
//!
//! A record keeps two things for one viewpoint of a belief world: the
//! materialized memory (latest known blocks, containers, agent status and the
//! events of every tick) and the append-only history of per-tick deltas. The
//! objective record sees everything; a subjective record only learns about the
//! blocks its agent can currently see and only receives the status and events
//! filtered for that agent.

mod error;
mod filter;
mod fold;

use std::collections::BTreeMap;

use belief_nest_core::{
    AgentStatus, Block, BlockPatch, BlockPos, BlockUpdate, ContainerPatch, CoreError, Event,
    HistoryEntry, ItemCounts, PlayerVisibility, PosMap, Tick, TickMap, Visibility,
    VisibilityGrid,
};
use serde::{Deserialize, Serialize};

pub use error::RecordError;
pub use filter::{filter_events, filter_status};

/// What happens to the remembered pose of an agent missing from a tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionMemory {
    /// Keep the last pose that was seen.
    #[default]
    LastSeen,
    /// Forget the pose until the agent is seen again.
    Current,
}

/// Materialized state of a record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// Latest known block per cell.
    pub blocks: PosMap<Block>,
    /// Latest known contents per chest.
    pub containers: PosMap<ItemCounts>,
    /// Latest known status per agent.
    pub status: BTreeMap<String, AgentStatus>,
    /// Events of every tick that had any.
    #[serde(default)]
    pub events: BTreeMap<Tick, Vec<Event>>,
}

/// Viewpoint a record is kept for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordKind {
    /// Ground truth of the belief world.
    Objective,
    /// Visibility-filtered view of one agent.
    Subjective(String),
}

impl RecordKind {
    const fn label(&self) -> &'static str {
        match self {
            RecordKind::Objective => "objective",
            RecordKind::Subjective(_) => "subjective",
        }
    }
}

/// Serialized memory and history of a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// Memory as JSON.
    pub state: String,
    /// History as a JSON tick map.
    pub history: String,
}

/// Memory plus history for one viewpoint.
#[derive(Clone, Debug)]
pub struct ObservationRecord {
    kind: RecordKind,
    policy: PositionMemory,
    memory: Memory,
    history: TickMap<HistoryEntry>,
}

impl ObservationRecord {
    /// Creates the ground-truth record of a belief world.
    #[must_use]
    pub fn new_objective(policy: PositionMemory) -> Self {
        Self::new(RecordKind::Objective, policy)
    }

    /// Creates the record of what `agent` perceives.
    #[must_use]
    pub fn new_subjective(agent: impl Into<String>, policy: PositionMemory) -> Self {
        Self::new(RecordKind::Subjective(agent.into()), policy)
    }

    fn new(kind: RecordKind, policy: PositionMemory) -> Self {
        Self {
            kind,
            policy,
            memory: Memory::default(),
            history: TickMap::new(),
        }
    }

    /// Viewpoint of the record.
    #[must_use]
    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    /// Agent owning a subjective record.
    #[must_use]
    pub fn agent_name(&self) -> Option<&str> {
        match &self.kind {
            RecordKind::Objective => None,
            RecordKind::Subjective(agent) => Some(agent),
        }
    }

    /// Current memory.
    #[must_use]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Full history.
    #[must_use]
    pub fn history(&self) -> &TickMap<HistoryEntry> {
        &self.history
    }

    /// History entry recorded at `tick`.
    #[must_use]
    pub fn history_at(&self, tick: Tick) -> Option<&HistoryEntry> {
        self.history.get(tick)
    }

    /// Latest recorded tick.
    #[must_use]
    pub fn last_tick(&self) -> Option<Tick> {
        self.history.last_tick()
    }

    /// Visibility recorded at `tick`.
    #[must_use]
    pub fn visibility_at(&self, tick: Tick) -> Option<&Visibility> {
        self.history.get(tick)?.visibility.as_ref()
    }

    /// Records a tick of ground truth.
    ///
    /// `roster` lists the agents of the belief world; agents missing from
    /// `status` keep or lose their pose according to the record's policy.
    pub fn add_history_objective(
        &mut self,
        tick: Tick,
        status: BTreeMap<String, AgentStatus>,
        events: Vec<Event>,
        blocks_to_update: Vec<BlockUpdate>,
        visibility: Option<Visibility>,
        roster: &[String],
    ) -> Result<(), RecordError> {
        self.require("objective", matches!(self.kind, RecordKind::Objective))?;
        fold::validate_events(tick, &events)?;
        fold::apply(
            &mut self.memory,
            tick,
            &status,
            &events,
            &blocks_to_update,
            roster,
            self.policy,
        );
        let _ = self.history.insert(
            tick,
            HistoryEntry {
                events,
                status,
                visibility,
                updated_blocks: blocks_to_update,
            },
        );
        Ok(())
    }

    /// Records a tick as perceived by the record's agent.
    ///
    /// Visible cells are refreshed from `objective_blocks`; only cells whose
    /// block differs from memory end up in the entry's updated blocks.
    #[allow(clippy::too_many_arguments)]
    pub fn add_history_subjective(
        &mut self,
        tick: Tick,
        status: BTreeMap<String, AgentStatus>,
        events: Vec<Event>,
        players: PlayerVisibility,
        blocks: Option<VisibilityGrid>,
        objective_blocks: &PosMap<Block>,
        roster: &[String],
    ) -> Result<(), RecordError> {
        self.require("subjective", matches!(self.kind, RecordKind::Subjective(_)))?;
        fold::validate_events(tick, &events)?;

        let updated_blocks: Vec<BlockUpdate> = blocks
            .iter()
            .flat_map(VisibilityGrid::iter)
            .filter_map(|pos| {
                let seen = objective_blocks.get(pos)?;
                (self.memory.blocks.get(pos) != Some(seen))
                    .then(|| BlockUpdate::new(pos, seen.clone()))
            })
            .collect();

        fold::apply(
            &mut self.memory,
            tick,
            &status,
            &events,
            &updated_blocks,
            roster,
            self.policy,
        );
        let visibility = Visibility {
            players,
            blocks: blocks.filter(|grid| grid.count() > 0),
        };
        let _ = self.history.insert(
            tick,
            HistoryEntry {
                events,
                status,
                visibility: Some(visibility),
                updated_blocks,
            },
        );
        Ok(())
    }

    /// Folds recorded entries onto the current memory and appends them to the
    /// history, reproducing the memory that existed when they were recorded.
    pub fn replay(
        &mut self,
        history: &TickMap<HistoryEntry>,
        roster: &[String],
    ) -> Result<(), RecordError> {
        for (tick, entry) in history.iter() {
            fold::validate_events(tick, &entry.events)?;
        }
        for (tick, entry) in history.iter() {
            fold::apply(
                &mut self.memory,
                tick,
                &entry.status,
                &entry.events,
                &entry.updated_blocks,
                roster,
                self.policy,
            );
            let _ = self.history.insert(tick, entry.clone());
        }
        tracing::debug!(
            record = self.kind.label(),
            ticks = history.len(),
            "replayed history"
        );
        Ok(())
    }

    /// Copy of the remembered blocks. `None` copies every block, otherwise
    /// only blocks whose name is listed are copied.
    #[must_use]
    pub fn block_memory(&self, types: Option<&[String]>) -> PosMap<Block> {
        match types {
            None => self.memory.blocks.clone(),
            Some(types) => self
                .memory
                .blocks
                .iter()
                .filter(|(_, block)| types.contains(&block.name))
                .map(|(pos, block)| (pos, block.clone()))
                .collect(),
        }
    }

    /// Replaces the remembered blocks.
    pub fn set_block_memory(&mut self, blocks: PosMap<Block>) {
        self.memory.blocks = blocks;
    }

    /// Recorded ticks in `start..=end`, checked to be strictly increasing.
    pub fn ticks_in_range(&self, start: Tick, end: Tick) -> Result<Vec<Tick>, RecordError> {
        let ticks = self.history.range_keys(start, end);
        if let Some(pair) = ticks.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(CoreError::NonMonotonic(pair[1]).into());
        }
        Ok(ticks)
    }

    /// Applies an explicit patch to memory.
    pub fn overwrite_state(&mut self, blocks: &[BlockPatch], containers: &[ContainerPatch]) {
        for patch in blocks {
            let pos = BlockPos::from(patch.position);
            match &patch.name {
                Some(name) => {
                    let block = Block {
                        name: name.clone(),
                        state_id: None,
                        properties: patch.properties.clone(),
                    };
                    let _ = self.memory.blocks.insert(pos, block);
                }
                None => {
                    let _ = self.memory.blocks.remove(pos);
                }
            }
        }
        for patch in containers {
            let pos = BlockPos::from(patch.position);
            match &patch.items {
                Some(items) => {
                    let _ = self.memory.containers.insert(pos, items.clone());
                }
                None => {
                    let _ = self.memory.containers.remove(pos);
                }
            }
        }
    }

    /// Serializes memory and the history from `start_tick` onwards.
    pub fn export(&self, start_tick: Tick) -> Result<Snapshot, RecordError> {
        let state = serde_json::to_string_pretty(&self.memory)?;
        let history =
            serde_json::to_string_pretty(&self.history.slice(start_tick, Tick::new(i64::MAX)))?;
        Ok(Snapshot { state, history })
    }

    /// Replaces memory and history with serialized ones. A missing history
    /// leaves the record with an empty one.
    pub fn import(&mut self, state: &str, history: Option<&str>) -> Result<(), RecordError> {
        match history {
            Some(text) => self.import_fragments(state, &[text]),
            None => self.import_fragments::<&str>(state, &[]),
        }
    }

    /// Replaces memory with a serialized one and history with the union of
    /// independently serialized history fragments.
    pub fn import_fragments<S: AsRef<str>>(
        &mut self,
        state: &str,
        fragments: &[S],
    ) -> Result<(), RecordError> {
        let memory: Memory = serde_json::from_str(state)
            .map_err(|error| RecordError::CorruptedSnapshot(format!("state: {error}")))?;
        let history = TickMap::merge_serialized(fragments).map_err(|error| {
            RecordError::CorruptedSnapshot(format!("history: {error}"))
        })?;
        self.memory = memory;
        self.history = history;
        tracing::debug!(
            record = self.kind.label(),
            fragments = fragments.len(),
            first = ?self.history.first_tick(),
            last = ?self.history.last_tick(),
            "loaded record"
        );
        Ok(())
    }

    fn require(&self, expected: &'static str, matches: bool) -> Result<(), RecordError> {
        if matches {
            Ok(())
        } else {
            Err(RecordError::WrongKind {
                expected,
                actual: self.kind.label().to_owned(),
            })
        }
    }
}
