use std::{path::PathBuf, time::Duration};

use belief_nest_core::{BlockPos, EnvBox};
use belief_nest_system_observation::{ManagerSettings, ObservationConfig};
use belief_nest_world::WorldAddress;
use serde::{Deserialize, Serialize};

/// Settings of a belief nest, shared by every world of the tree.
///
/// `offset`, `player_prefix`, `host` and `port` describe the root world;
/// child worlds get their own when they are created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Game server host of the root world.
    pub host: String,
    /// Game server port of the root world.
    pub port: u16,
    /// Offset of the root world inside the game world.
    pub offset: [i32; 3],
    /// Two opposite corners of the environment box, relative to the offset.
    pub env_box: [[i32; 3]; 2],
    /// Block types every agent knows from the start.
    pub static_block_types: Vec<String>,
    /// Prefix of the root world's game names.
    pub player_prefix: String,
    /// Agent name of every world's admin.
    pub admin_agent_name: String,
    /// Root of the checkpoint tree.
    pub ckpt_dir: PathBuf,
    /// Height of an agent's eyes above its feet.
    pub eye_height: f64,
    /// Attempts at starting an agent worker.
    pub worker_retry_limit: u32,
    /// Time an agent worker gets to report ready.
    pub worker_ready_timeout_ms: u64,
    /// Observation tunables.
    pub observation: ObservationConfig,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 25565,
            offset: [0, 0, 0],
            env_box: [[-32, -64, -32], [32, 64, 32]],
            static_block_types: vec!["bedrock".to_owned()],
            player_prefix: String::new(),
            admin_agent_name: "admin".to_owned(),
            ckpt_dir: PathBuf::from("ckpt"),
            eye_height: 1.62,
            worker_retry_limit: 5,
            worker_ready_timeout_ms: 60_000,
            observation: ObservationConfig::default(),
        }
    }
}

impl WorldConfig {
    /// Address of the root world's game server.
    #[must_use]
    pub fn address(&self) -> WorldAddress {
        WorldAddress::new(self.host.clone(), self.port)
    }

    /// Environment box in relative coordinates.
    #[must_use]
    pub fn env_box(&self) -> EnvBox {
        let [a, b] = self.env_box;
        EnvBox::new(BlockPos::from(a), BlockPos::from(b))
    }

    pub(crate) fn worker_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_ready_timeout_ms)
    }

    pub(crate) fn manager_settings(&self, offset: BlockPos) -> ManagerSettings {
        ManagerSettings {
            config: self.observation.clone(),
            env_box: self.env_box(),
            offset,
            eye_height: self.eye_height,
            static_block_types: self.static_block_types.clone(),
        }
    }
}
