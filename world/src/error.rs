use std::time::Duration;

use belief_nest_core::BlockPos;
use thiserror::Error;

/// Failures reported by the external world and the connection registry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WorldError {
    /// A world mutation was not observed before the deadline.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// Description of the awaited state.
        what: String,
        /// Time spent waiting.
        waited: Duration,
    },
    /// A block could not be placed.
    #[error("failed to place block at {pos}: {reason}")]
    Placement {
        /// Target cell.
        pos: BlockPos,
        /// Reason given by the world.
        reason: String,
    },
    /// No player with that name is connected.
    #[error("player `{0}` is not connected")]
    UnknownPlayer(String),
    /// A player with that name is already connected.
    #[error("player `{0}` is already connected")]
    PlayerExists(String),
    /// A belief world registered twice against the same address.
    #[error("belief world {belief_path} is already registered at {address}")]
    DuplicateRegistration {
        /// Shared world address.
        address: String,
        /// Registering belief world.
        belief_path: String,
    },
    /// A belief world released a registration it never made.
    #[error("belief world {belief_path} is not registered at {address}")]
    UnknownRegistration {
        /// Shared world address.
        address: String,
        /// Releasing belief world.
        belief_path: String,
    },
    /// The connection to the world could not be established or was lost.
    #[error("world connection failed: {0}")]
    Connection(String),
    /// An agent program could not be run.
    #[error("agent program rejected: {0}")]
    Program(String),
}
