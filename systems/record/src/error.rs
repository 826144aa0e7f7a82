use belief_nest_core::{CoreError, Tick};
use thiserror::Error;

/// Failures raised by observation records.
#[derive(Debug, Error)]
pub enum RecordError {
    /// An objective operation was called on a subjective record or the
    /// other way round.
    #[error("cannot add {expected} history to the {actual} record")]
    WrongKind {
        /// Kind the operation requires.
        expected: &'static str,
        /// Kind of the record.
        actual: String,
    },
    /// A chest event did not say which chest it used.
    #[error("`{event}` event at tick {tick} has no chest position")]
    MissingChestPosition {
        /// Name of the event.
        event: &'static str,
        /// Tick being recorded.
        tick: Tick,
    },
    /// A snapshot did not have the expected structure.
    #[error("corrupted snapshot: {0}")]
    CorruptedSnapshot(String),
    /// History ticks were out of order.
    #[error(transparent)]
    Core(#[from] CoreError),
    /// A snapshot could not be encoded.
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}
