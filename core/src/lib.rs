#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Core contracts shared across the belief nest engine.
//!
//! This crate defines the vocabulary every other crate speaks: integer voxel
//! coordinates and continuous points, the block/container/status/event data
//! model recorded per tick, the spatial and temporal containers that hold it,
//! and the tagged wire shapes those containers use when they are written to
//! checkpoint files. Nothing in here performs I/O; higher layers combine these
//! values into observation records, visibility sets and replication messages.

mod containers;
mod error;
mod model;
mod names;
pub mod wire;

use std::{fmt, ops::Add};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub use containers::{PosMap, TickMap, TickSlice, VisibilityGrid};
pub use error::CoreError;
pub use model::{
    AgentStatus, Block, BlockPatch, BlockUpdate, ChatLine, ChestContents, ChestDeposit,
    ChestWithdrawal, ContainerPatch, CraftedItem, Event, EventClass, EventKind, HiddenStatus,
    HistoryEntry, ItemCounts, ItemTransfer, LeverUse, MinedBlock, Movement, PlayerVisibility,
    SmeltedItem, Thought, Visibility, VisibleStatus, CONTAINER_BLOCK, EQUIPMENT_SLOTS,
};
pub use names::{validate_name, BeliefPath, BranchPath, DEFAULT_BRANCH, FOLLOW_BRANCH};

/// Number of the tick that precedes all recorded history.
pub const INITIAL_TICK: Tick = Tick::new(-1);

/// Discrete simulation time unit shared by every belief world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tick(i64);

impl Tick {
    /// Creates a tick from its raw value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Raw value of the tick.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Tick immediately following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Tick immediately preceding this one.
    #[must_use]
    pub const fn previous(self) -> Self {
        Self(self.0 - 1)
    }

    /// Whether the tick is the sentinel that precedes recorded history.
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == INITIAL_TICK.0
    }

    /// Number of ticks elapsed since `earlier`.
    #[must_use]
    pub const fn since(self, earlier: Tick) -> i64 {
        self.0 - earlier.0
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Integer voxel coordinate identifying a single block cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockPos {
    x: i32,
    y: i32,
    z: i32,
}

impl BlockPos {
    /// Creates a new block coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Coordinate along the east/west axis.
    #[must_use]
    pub const fn x(&self) -> i32 {
        self.x
    }

    /// Vertical coordinate.
    #[must_use]
    pub const fn y(&self) -> i32 {
        self.y
    }

    /// Coordinate along the north/south axis.
    #[must_use]
    pub const fn z(&self) -> i32 {
        self.z
    }

    /// Component-wise sum of two coordinates.
    #[must_use]
    pub const fn offset(&self, by: BlockPos) -> Self {
        Self::new(self.x + by.x, self.y + by.y, self.z + by.z)
    }

    /// Component-wise difference of two coordinates.
    #[must_use]
    pub const fn minus(&self, other: BlockPos) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    /// Continuous point at the cell's minimum corner.
    #[must_use]
    pub fn corner(&self) -> Point {
        Point::new(f64::from(self.x), f64::from(self.y), f64::from(self.z))
    }

    /// Continuous point at the cell's center.
    #[must_use]
    pub fn center(&self) -> Point {
        self.corner() + Point::new(0.5, 0.5, 0.5)
    }

    /// Components as an array in `x, y, z` order.
    #[must_use]
    pub const fn to_array(&self) -> [i32; 3] {
        [self.x, self.y, self.z]
    }

    /// Textual key in the `x,y,z` form used by coordinate maps.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{},{},{}", self.x, self.y, self.z)
    }

    /// Parses a textual `x,y,z` key.
    pub fn parse_key(key: &str) -> Result<Self, CoreError> {
        let mut parts = key.split(',');
        let mut next = || -> Result<i32, CoreError> {
            parts
                .next()
                .and_then(|part| part.trim().parse::<i32>().ok())
                .ok_or_else(|| CoreError::InvalidCoordinate(key.to_owned()))
        };
        let pos = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(CoreError::InvalidCoordinate(key.to_owned()));
        }
        Ok(pos)
    }

    /// Converts a continuous triple into a coordinate, rejecting fractional or
    /// non-finite components.
    pub fn try_from_components(components: [f64; 3]) -> Result<Self, CoreError> {
        let mut out = [0_i32; 3];
        for (slot, value) in out.iter_mut().zip(components) {
            if !value.is_finite()
                || value.fract() != 0.0
                || value < f64::from(i32::MIN)
                || value > f64::from(i32::MAX)
            {
                return Err(CoreError::InvalidCoordinate(format!("{components:?}")));
            }
            *slot = value as i32;
        }
        Ok(Self::new(out[0], out[1], out[2]))
    }
}

impl From<[i32; 3]> for BlockPos {
    fn from(value: [i32; 3]) -> Self {
        Self::new(value[0], value[1], value[2])
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

impl Serialize for BlockPos {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        wire::Wire::<()>::Vec3([
            f64::from(self.x),
            f64::from(self.y),
            f64::from(self.z),
        ])
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BlockPos {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let components = wire::Wire::<()>::deserialize(deserializer)?
            .into_vec3()
            .map_err(de::Error::custom)?;
        Self::try_from_components(components).map_err(de::Error::custom)
    }
}

/// Continuous position or direction in world space.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    x: f64,
    y: f64,
    z: f64,
}

impl Point {
    /// Creates a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Coordinate along the east/west axis.
    #[must_use]
    pub const fn x(&self) -> f64 {
        self.x
    }

    /// Vertical coordinate.
    #[must_use]
    pub const fn y(&self) -> f64 {
        self.y
    }

    /// Coordinate along the north/south axis.
    #[must_use]
    pub const fn z(&self) -> f64 {
        self.z
    }

    /// Whether every component is a finite number.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Euclidean distance between two points.
    #[must_use]
    pub fn distance(&self, other: Point) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        let dz = other.z - self.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Cell containing the point.
    #[must_use]
    pub fn floor(&self) -> BlockPos {
        BlockPos::new(
            self.x.floor() as i32,
            self.y.floor() as i32,
            self.z.floor() as i32,
        )
    }

    /// Point rounded to the provided number of decimals.
    #[must_use]
    pub fn rounded(&self, decimals: i32) -> Self {
        Self::new(
            round_to(self.x, decimals),
            round_to(self.y, decimals),
            round_to(self.z, decimals),
        )
    }

    /// Point translated by an integer cell offset.
    #[must_use]
    pub fn shifted(&self, by: BlockPos) -> Self {
        *self + by.corner()
    }

    /// Point translated by the inverse of an integer cell offset.
    #[must_use]
    pub fn unshifted(&self, by: BlockPos) -> Self {
        Self::new(
            self.x - f64::from(by.x()),
            self.y - f64::from(by.y()),
            self.z - f64::from(by.z()),
        )
    }

    /// Components as an array in `x, y, z` order.
    #[must_use]
    pub const fn to_array(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Serialize for Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        wire::Wire::<()>::Vec3(self.to_array()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Point {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let [x, y, z] = wire::Wire::<()>::deserialize(deserializer)?
            .into_vec3()
            .map_err(de::Error::custom)?;
        Ok(Self::new(x, y, z))
    }
}

/// Rounds a value to the provided number of decimals.
#[must_use]
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10_f64.powi(decimals);
    (value * scale).round() / scale
}

/// Inclusive axis-aligned box of cells bounding a belief world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvBox {
    min: BlockPos,
    max: BlockPos,
}

impl EnvBox {
    /// Creates a box from two opposite corners, normalising their order.
    #[must_use]
    pub fn new(a: BlockPos, b: BlockPos) -> Self {
        Self {
            min: BlockPos::new(a.x().min(b.x()), a.y().min(b.y()), a.z().min(b.z())),
            max: BlockPos::new(a.x().max(b.x()), a.y().max(b.y()), a.z().max(b.z())),
        }
    }

    /// Minimum corner of the box.
    #[must_use]
    pub const fn min(&self) -> BlockPos {
        self.min
    }

    /// Maximum corner of the box.
    #[must_use]
    pub const fn max(&self) -> BlockPos {
        self.max
    }

    /// Whether the cell lies inside the box.
    #[must_use]
    pub const fn contains(&self, pos: BlockPos) -> bool {
        pos.x() >= self.min.x()
            && pos.x() <= self.max.x()
            && pos.y() >= self.min.y()
            && pos.y() <= self.max.y()
            && pos.z() >= self.min.z()
            && pos.z() <= self.max.z()
    }

    /// Box translated by an integer offset.
    #[must_use]
    pub const fn shifted(&self, by: BlockPos) -> Self {
        Self {
            min: self.min.offset(by),
            max: self.max.offset(by),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockPos, EnvBox, Point, Tick};
    use serde::{de::DeserializeOwned, Serialize};

    fn assert_round_trip<T>(value: &T)
    where
        T: Serialize + DeserializeOwned + PartialEq + std::fmt::Debug,
    {
        let bytes = bincode::serialize(value).expect("serialize");
        let restored: T = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(&restored, value);
    }

    #[test]
    fn tick_round_trips_through_bincode() {
        assert_round_trip(&Tick::new(42));
    }

    #[test]
    fn env_box_round_trips_through_bincode() {
        let env_box = EnvBox::new(BlockPos::new(5, 0, -3), BlockPos::new(-5, 10, 3));
        assert_round_trip(&env_box);
    }

    #[test]
    fn block_pos_key_parses_back() {
        let pos = BlockPos::new(-4, 63, 12);
        assert_eq!(BlockPos::parse_key(&pos.key()).expect("valid key"), pos);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for key in ["", "1,2", "1,2,3,4", "a,b,c", "1.5,2,3"] {
            assert!(BlockPos::parse_key(key).is_err(), "{key} should be rejected");
        }
    }

    #[test]
    fn fractional_components_are_not_coordinates() {
        assert!(BlockPos::try_from_components([1.0, 2.5, 3.0]).is_err());
        assert!(BlockPos::try_from_components([f64::NAN, 0.0, 0.0]).is_err());
        assert_eq!(
            BlockPos::try_from_components([1.0, -2.0, 3.0]).expect("integral"),
            BlockPos::new(1, -2, 3)
        );
    }

    #[test]
    fn env_box_normalises_corners() {
        let env_box = EnvBox::new(BlockPos::new(5, 0, -3), BlockPos::new(-5, 10, 3));
        assert_eq!(env_box.min(), BlockPos::new(-5, 0, -3));
        assert_eq!(env_box.max(), BlockPos::new(5, 10, 3));
        assert!(env_box.contains(BlockPos::new(0, 10, 0)));
        assert!(!env_box.contains(BlockPos::new(0, 11, 0)));
    }

    #[test]
    fn points_serialize_as_tagged_vectors() {
        let json = serde_json::to_string(&Point::new(1.5, 2.0, -3.25)).expect("serialize");
        assert_eq!(json, r#"{"__Vec3__":[1.5,2.0,-3.25]}"#);
        let restored: Point = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, Point::new(1.5, 2.0, -3.25));
    }

    #[test]
    fn rounding_matches_decimal_precision() {
        let point = Point::new(1.23456, -0.0004, 9.9996).rounded(3);
        assert_eq!(point, Point::new(1.235, -0.0, 10.0));
    }
}
