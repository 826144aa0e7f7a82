#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! External game-world seam for the belief nest engine.
//!
//! Belief worlds never talk to the game server directly. They go through
//! [`GameWorld`], an asynchronous interface expressed in world-absolute
//! coordinates, and share one connection per server address through the
//! [`ConnectionRegistry`]. [`VoxelWorld`] is an in-memory implementation used
//! by tests and offline tooling.

mod catalog;
mod convergence;
mod error;
mod registry;
mod voxel;

use async_trait::async_trait;
use belief_nest_core::{Block, BlockPos, BlockUpdate, EnvBox, Event, ItemCounts, Point};
use tokio::sync::broadcast;

pub use catalog::{BlockState, Occluder, ShapeBox, ShapeCatalog};
pub use convergence::{place_and_confirm, teleport_and_wait, WaitPolicy, POLL_INTERVAL};
pub use error::WorldError;
pub use registry::{ConnectionRegistry, WorldAddress, WorldConnector};
pub use voxel::{query, VoxelConnector, VoxelWorld};

/// Raw status of a connected player in world-absolute coordinates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlayerSample {
    /// Feet position.
    pub position: Point,
    /// Velocity in blocks per tick.
    pub velocity: Point,
    /// Horizontal look angle.
    pub yaw: f64,
    /// Vertical look angle.
    pub pitch: f64,
    /// Whether the player stands on a block.
    pub on_ground: bool,
    /// Item type per equipment slot.
    pub equipment: Vec<Option<String>>,
    /// Whether the player is in water.
    pub is_in_water: bool,
    /// Whether the player is in lava.
    pub is_in_lava: bool,
    /// Whether the player is caught in a web.
    pub is_in_web: bool,
    /// Inventory contents.
    pub inventory: ItemCounts,
    /// Health points.
    pub health: f64,
    /// Food level.
    pub food: f64,
    /// Food saturation.
    pub saturation: f64,
    /// Remaining breath.
    pub oxygen: f64,
    /// Whether the player touches a wall.
    pub is_collided_horizontally: bool,
    /// Whether the player touches a floor or ceiling.
    pub is_collided_vertically: bool,
    /// Biome at the player's position.
    pub biome: String,
    /// Game time of day in ticks, `0..24000`.
    pub time_of_day: u32,
}

/// Result of running an agent program.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionOutcome {
    /// Whether the program completed.
    pub success: bool,
    /// Failure description when it did not.
    pub error_message: Option<String>,
    /// Events the program produced, in world-absolute coordinates.
    pub events: Vec<Event>,
}

/// Asynchronous interface to the shared game server.
///
/// Every coordinate is world-absolute. Mutations return once the command was
/// accepted; callers that need the effect to be visible wait with the
/// helpers in this crate.
#[async_trait]
pub trait GameWorld: Send + Sync {
    /// Physical shapes of the blocks this world knows.
    fn catalog(&self) -> &ShapeCatalog;

    /// Stream of block changes as they happen.
    fn subscribe_block_changes(&self) -> broadcast::Receiver<BlockUpdate>;

    /// Names of every connected player.
    async fn player_names(&self) -> Vec<String>;

    /// Connects a player under its game name.
    async fn connect_player(&self, game_name: &str) -> Result<(), WorldError>;

    /// Disconnects a player.
    async fn disconnect_player(&self, game_name: &str) -> Result<(), WorldError>;

    /// Current status of a player, `None` when not connected.
    async fn sample_player(&self, game_name: &str) -> Option<PlayerSample>;

    /// Whether the player is currently walking towards a goal.
    async fn is_moving(&self, game_name: &str) -> bool;

    /// Block occupying a cell, `None` for unloaded or empty cells.
    async fn block_at(&self, pos: BlockPos) -> Option<Block>;

    /// Places blocks.
    async fn set_blocks(&self, updates: &[BlockUpdate]) -> Result<(), WorldError>;

    /// Fills every cell of the box with air and empties its containers.
    async fn clear_box(&self, env_box: EnvBox) -> Result<(), WorldError>;

    /// Replaces the contents of the container at a cell.
    async fn set_container(&self, pos: BlockPos, items: &ItemCounts) -> Result<(), WorldError>;

    /// Asks the server to move a player.
    async fn move_player(&self, game_name: &str, to: Point) -> Result<(), WorldError>;

    /// Replaces a player's inventory and equipment.
    async fn set_inventory_and_equipment(
        &self,
        game_name: &str,
        inventory: &ItemCounts,
        equipment: &[Option<String>],
    ) -> Result<(), WorldError>;

    /// Replaces a player's equipment.
    async fn set_equipment(
        &self,
        game_name: &str,
        equipment: &[Option<String>],
    ) -> Result<(), WorldError>;

    /// Hides or reveals a player.
    async fn set_transparency(&self, game_name: &str, transparent: bool) -> Result<(), WorldError>;

    /// Runs an agent program on behalf of a player.
    async fn execute(&self, game_name: &str, program: &str) -> Result<ExecutionOutcome, WorldError>;

    /// Releases the connection.
    async fn shutdown(&self) {}
}
