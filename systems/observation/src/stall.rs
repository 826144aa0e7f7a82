//! Detection of agents that keep walking without getting anywhere.

use std::collections::{BTreeMap, VecDeque};

use belief_nest_core::{BlockPos, Point};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::ObservationConfig;

const NUDGE_HEIGHT: f64 = 1.25;

/// Cells an agent may be nudged into, relative to the cell it stands in.
pub(crate) const NUDGE_CANDIDATES: [BlockPos; 7] = [
    BlockPos::new(0, 0, 0),
    BlockPos::new(1, 0, 0),
    BlockPos::new(-1, 0, 0),
    BlockPos::new(0, 1, 0),
    BlockPos::new(0, -1, 0),
    BlockPos::new(0, 0, 1),
    BlockPos::new(0, 0, -1),
];

#[derive(Debug, Default)]
struct Track {
    moving_ticks: u32,
    positions: VecDeque<Point>,
}

/// Rolling window of sampled positions per moving agent.
#[derive(Debug)]
pub(crate) struct StallDetector {
    window: usize,
    every: u32,
    threshold: f64,
    tracks: BTreeMap<String, Track>,
}

impl StallDetector {
    pub(crate) fn new(config: &ObservationConfig) -> Self {
        Self {
            window: config.stall_window.max(2),
            every: config.stall_ticks.max(1),
            threshold: config.stall_threshold,
            tracks: BTreeMap::new(),
        }
    }

    /// Counts a tick the agent spent moving. Returns whether a position
    /// sample is due.
    pub(crate) fn count_moving_tick(&mut self, agent: &str) -> bool {
        let track = self.tracks.entry(agent.to_owned()).or_default();
        track.moving_ticks += 1;
        if track.moving_ticks >= self.every {
            track.moving_ticks = 0;
            true
        } else {
            false
        }
    }

    /// Adds a sampled position. Returns whether the agent is stalled, which
    /// is the case when a full window spans less than the threshold.
    pub(crate) fn record(&mut self, agent: &str, position: Point) -> bool {
        let track = self.tracks.entry(agent.to_owned()).or_default();
        track.positions.push_back(position);
        if track.positions.len() < self.window {
            return false;
        }
        let stalled = track
            .positions
            .front()
            .map_or(false, |oldest| oldest.distance(position) < self.threshold);
        let _ = track.positions.pop_front();
        stalled
    }
}

/// Where to move a stalled agent: the center of a random free cell, or
/// straight up when none is free.
pub(crate) fn nudge_target(rng: &mut ChaCha8Rng, position: Point, free: &[BlockPos]) -> Point {
    match free.choose(rng) {
        Some(cell) => Point::new(
            f64::from(cell.x()) + 0.5,
            f64::from(cell.y()),
            f64::from(cell.z()) + 0.5,
        ),
        None => Point::new(position.x(), position.y() + NUDGE_HEIGHT, position.z()),
    }
}
