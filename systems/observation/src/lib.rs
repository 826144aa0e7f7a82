#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Observation manager of a belief world.
//!
//! An [`ObservationManager`] keeps one objective record of everything that
//! happens inside its belief world's environment box and one subjective record
//! per agent. In observe mode it samples the external world every tick; in
//! follow mode it replays the subjective history its parent world replicates
//! to it. Records are persisted as checkpoint files in the world's branch
//! directory.

mod broker;
pub mod checkpoint;
mod config;
mod error;
mod follow;
mod manager;
mod observe;
mod replication;
mod stall;
mod status;

use std::{fmt, str::FromStr};

use belief_nest_core::{BlockPos, EnvBox};

pub use broker::{AgentBroker, EventBatch, SamplingSignal};
pub use config::ObservationConfig;
pub use error::ObservationError;
pub use manager::{DumpOptions, ManagerStatus, ObservationManager, OverwriteOutcome, StopOptions};
pub use replication::{
    replication_channel, ChildRequest, DownstreamPort, ParentReply, ReplicatedTick, UpstreamPort,
};
pub use status::{agent_status, relativize, time_of_day_label, AgentVitals};

/// What drives the records of a belief world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Sample the external world.
    Observe,
    /// Replay the history replicated by the parent world.
    Follow,
}

impl Mode {
    /// Lowercase name of the mode.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Mode::Observe => "observe",
            Mode::Follow => "follow",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Mode {
    type Err = ObservationError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "observe" => Ok(Mode::Observe),
            "follow" => Ok(Mode::Follow),
            other => Err(ObservationError::InvalidMode(other.to_owned())),
        }
    }
}

/// Fixed parameters of a belief world's manager.
#[derive(Clone, Debug)]
pub struct ManagerSettings {
    /// Tunables.
    pub config: ObservationConfig,
    /// Environment box in relative coordinates.
    pub env_box: EnvBox,
    /// Offset of the belief world inside the external world.
    pub offset: BlockPos,
    /// Height of an agent's eyes above its feet.
    pub eye_height: f64,
    /// Block types every agent knows from the start.
    pub static_block_types: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::Mode;

    #[test]
    fn modes_parse_from_their_labels() {
        assert_eq!("observe".parse::<Mode>().expect("mode"), Mode::Observe);
        assert_eq!("follow".parse::<Mode>().expect("mode"), Mode::Follow);
        assert!("watch".parse::<Mode>().is_err());
        assert_eq!(Mode::Follow.to_string(), "follow");
    }
}
