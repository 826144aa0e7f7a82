use belief_nest_core::CoreError;
use belief_nest_system_observation::ObservationError;
use belief_nest_world::WorldError;
use thiserror::Error;

/// Failures raised while managing the belief world tree.
#[derive(Debug, Error)]
pub enum HierarchyError {
    /// The agent name is reserved for the engine.
    #[error("agent name `{0}` is reserved")]
    ReservedName(String),
    /// An agent or connected player already uses the name.
    #[error("agent name `{0}` is already in use")]
    DuplicateName(String),
    /// The prefixed game name exceeds what the server accepts.
    #[error("game name `{name}` is longer than {limit} characters")]
    NameTooLong {
        /// Prefixed game name.
        name: String,
        /// Maximum length.
        limit: usize,
    },
    /// No agent with that name is in the world.
    #[error("agent `{0}` not found")]
    AgentNotFound(String),
    /// The agent has no child world.
    #[error("agent `{0}` has no child world")]
    NoChildWorld(String),
    /// The agent already has a child world.
    #[error("agent `{0}` already has a child world")]
    ChildWorldExists(String),
    /// A privileged operation was asked of a regular agent.
    #[error("{operation} is only for the admin player (asked of `{agent}`)")]
    NotAdmin {
        /// Rejected operation.
        operation: &'static str,
        /// Agent that was asked.
        agent: String,
    },
    /// Humans can only take part in the root world.
    #[error("human agent `{0}` can only join the root world")]
    HumanOnlyInRoot(String),
    /// A human joined before connecting to the server.
    #[error("human player `{0}` is not connected")]
    HumanNotConnected(String),
    /// The agent is played by a human and has no worker.
    #[error("agent `{0}` is controlled by a human")]
    HumanControlled(String),
    /// The agent worker did not come up.
    #[error("failed to create agent worker `{agent}` after {attempts} attempts: {reason}")]
    WorkerCreation {
        /// Game name of the agent.
        agent: String,
        /// Attempts made.
        attempts: u32,
        /// Failure of the last attempt.
        reason: String,
    },
    /// The agent worker went away.
    #[error("agent worker `{0}` has stopped")]
    WorkerGone(String),
    /// The world is not in the mode the operation needs.
    #[error("{0}")]
    WrongMode(String),
    /// A checkpoint directory could not be prepared.
    #[error("failed to prepare {}: {source}", path.display())]
    Io {
        /// File or directory involved.
        path: std::path::PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// A core value was invalid.
    #[error(transparent)]
    Core(#[from] CoreError),
    /// An external world operation failed.
    #[error(transparent)]
    World(#[from] WorldError),
    /// An observation manager operation failed.
    #[error(transparent)]
    Observation(#[from] ObservationError),
}

impl HierarchyError {
    pub(crate) fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
