#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Tree of belief worlds.
//!
//! A [`BeliefNest`] owns the root [`BeliefWorld`]. Every world has an admin,
//! a set of agents each running in its own worker task, and an observation
//! manager. An agent can own a child world holding what it believes; the
//! child replays its parent's history from the agent's point of view and can
//! branch off into its own timeline.
//!
//! Worlds are addressed by [`BeliefPath`](belief_nest_core::BeliefPath):
//! `/` is the root, `/alice/` the world alice imagines, `/alice/bob/` what
//! alice imagines bob imagines.

mod config;
mod error;
mod nest;
mod player;
mod worker;
mod world;

pub use config::WorldConfig;
pub use error::HierarchyError;
pub use nest::BeliefNest;
pub use player::{AgentKind, AgentPlayer};
pub use world::{BeliefWorld, ChildOptions, JoinOptions, SimStatus, GAME_NAME_LIMIT};
