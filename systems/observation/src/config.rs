use std::time::Duration;

use belief_nest_system_record::PositionMemory;
use serde::{Deserialize, Serialize};

/// Tunables of an observation manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationConfig {
    /// Ticks between two status samples.
    pub player_obs_interval: u32,
    /// Ticks between two block visibility computations.
    pub block_obs_interval: u32,
    /// Reach of sight in blocks.
    pub max_visible_distance: f64,
    /// Keep the pose of agents an observer cannot see.
    pub disable_position_filtering: bool,
    /// What records remember about agents missing from a tick.
    pub position_memory: PositionMemory,
    /// Block types treated as see-through in addition to the glass family.
    pub extra_transparent_blocks: Vec<String>,
    /// Period of the observe scheduler.
    pub tick_period_ms: u64,
    /// Period of the follow scheduler.
    pub follow_period_ms: u64,
    /// Period of the replication flush.
    pub flush_period_ms: u64,
    /// Positions kept to detect a stalled agent.
    pub stall_window: usize,
    /// Moving ticks between two stall samples.
    pub stall_ticks: u32,
    /// Distance below which a full window counts as stalled.
    pub stall_threshold: f64,
    /// Interval between progress messages while waiting.
    pub progress_log_period_ms: u64,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            player_obs_interval: 5,
            block_obs_interval: 10,
            max_visible_distance: 20.0,
            disable_position_filtering: false,
            position_memory: PositionMemory::LastSeen,
            extra_transparent_blocks: Vec::new(),
            tick_period_ms: 50,
            follow_period_ms: 50,
            flush_period_ms: 50,
            stall_window: 5,
            stall_ticks: 100,
            stall_threshold: 1.5,
            progress_log_period_ms: 500,
        }
    }
}

impl ObservationConfig {
    /// Time budget of one block visibility computation.
    #[must_use]
    pub fn block_visibility_budget(&self) -> Duration {
        Duration::from_millis(u64::from(self.block_obs_interval) * 50)
    }

    pub(crate) fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms.max(1))
    }

    pub(crate) fn follow_period(&self) -> Duration {
        Duration::from_millis(self.follow_period_ms.max(1))
    }

    pub(crate) fn flush_period(&self) -> Duration {
        Duration::from_millis(self.flush_period_ms.max(1))
    }

    pub(crate) fn progress_period(&self) -> Duration {
        Duration::from_millis(self.progress_log_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::ObservationConfig;
    use belief_nest_system_record::PositionMemory;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: ObservationConfig =
            serde_json::from_str(r#"{"block_obs_interval": 4, "position_memory": "current"}"#)
                .expect("config");
        assert_eq!(config.block_obs_interval, 4);
        assert_eq!(config.player_obs_interval, 5);
        assert_eq!(config.position_memory, PositionMemory::Current);
        assert_eq!(config.block_visibility_budget().as_millis(), 200);
    }
}
