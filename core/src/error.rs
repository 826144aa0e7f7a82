use thiserror::Error;

use crate::{BlockPos, Tick};

/// Failures raised while building or decoding core values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// A coordinate key did not describe an integer 3D position.
    #[error("`{0}` is not a valid integer 3D coordinate")]
    InvalidCoordinate(String),
    /// A visibility bit was set outside the grid's range.
    #[error("position {pos} lies outside the range {min}..={max}")]
    OutOfRange {
        /// Offending position.
        pos: BlockPos,
        /// Inclusive minimum corner of the grid.
        min: BlockPos,
        /// Inclusive maximum corner of the grid.
        max: BlockPos,
    },
    /// A tagged wire value carried a different shape than expected.
    #[error("expected a `{expected}` value but found `{found}`")]
    UnexpectedShape {
        /// Tag the decoder required.
        expected: &'static str,
        /// Tag the input carried.
        found: &'static str,
    },
    /// The packed bitset payload was not valid base64.
    #[error("invalid bitset encoding: {0}")]
    InvalidEncoding(String),
    /// A name contained characters outside `[A-Za-z0-9_]` or was empty.
    #[error("`{0}` must be non-empty and contain only [A-Za-z0-9_]")]
    InvalidName(String),
    /// A belief path was not of the form `/a/b/`.
    #[error("malformed belief path `{0}`")]
    InvalidBeliefPath(String),
    /// History ticks were found out of order.
    #[error("history ticks are not strictly increasing at tick {0}")]
    NonMonotonic(Tick),
    /// A serialized tick map could not be parsed.
    #[error("malformed tick map: {0}")]
    MalformedTickMap(String),
}
