use std::path::PathBuf;

use belief_nest_core::{CoreError, Tick};
use belief_nest_system_record::RecordError;
use belief_nest_world::WorldError;
use thiserror::Error;

/// Failures raised by the observation manager.
#[derive(Debug, Error)]
pub enum ObservationError {
    /// A mode name or a mode-specific option was not valid.
    #[error("invalid mode: {0}")]
    InvalidMode(String),
    /// The scheduler is running while the operation needs it stopped.
    #[error("already started in {0} mode")]
    AlreadyStarted(&'static str),
    /// The scheduler was started before a mode was chosen.
    #[error("set a mode before starting")]
    ModeNotSet,
    /// The scheduler is stopped while the operation needs it running.
    #[error("not active")]
    NotActive,
    /// A follow dump was asked for a tick other than the live one.
    #[error("expected to stop at tick {expected} but the world is at tick {actual}")]
    TickMismatch {
        /// Tick the caller expected.
        expected: Tick,
        /// Tick the world reached.
        actual: Tick,
    },
    /// Follow already went past the requested stop tick.
    #[error("stop tick {stop} already passed (now {now})")]
    StopTickPassed {
        /// Requested stop tick.
        stop: Tick,
        /// Live tick.
        now: Tick,
    },
    /// No snapshot exists in the branch directory.
    #[error("no snapshot found in {}", .0.display())]
    MissingSnapshot(PathBuf),
    /// A follow operation needs a parent world.
    #[error("world has no parent to follow")]
    NoParent,
    /// A child world was not attached.
    #[error("no child world attached for agent `{0}`")]
    UnknownChild(String),
    /// The counterpart of a channel went away.
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),
    /// A checkpoint file could not be read or written.
    #[error("checkpoint I/O failed for {}: {source}", path.display())]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// A checkpoint file name pattern could not be built.
    #[error("invalid checkpoint file pattern: {0}")]
    Pattern(#[from] regex::Error),
    /// A replicated tick could not be encoded or decoded.
    #[error("malformed replication payload: {0}")]
    Payload(#[from] serde_json::Error),
    /// A record operation failed.
    #[error(transparent)]
    Record(#[from] RecordError),
    /// A world operation failed.
    #[error(transparent)]
    World(#[from] WorldError),
    /// A core value was invalid.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ObservationError {
    /// Whether the failure breaks the integrity of the recorded timeline, in
    /// which case the scheduler stops instead of retrying.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::TickMismatch { .. } | Self::StopTickPassed { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
