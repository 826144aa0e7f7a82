use std::collections::{btree_map, BTreeMap};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de, de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    wire::{BitsetBody, PosEntry, TickEntries, Wire},
    BlockPos, CoreError, Tick,
};

/// Map keyed by integer voxel coordinate.
///
/// Keys are unique. Iteration order is by coordinate, which keeps snapshots
/// byte-stable, but callers must not rely on any particular order.
#[derive(Clone, Debug, PartialEq)]
pub struct PosMap<V> {
    entries: BTreeMap<BlockPos, V>,
}

impl<V> Default for PosMap<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<V> PosMap<V> {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no positions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores a value, returning the one it replaced.
    pub fn insert(&mut self, pos: BlockPos, value: V) -> Option<V> {
        self.entries.insert(pos, value)
    }

    /// Value stored at the position.
    #[must_use]
    pub fn get(&self, pos: BlockPos) -> Option<&V> {
        self.entries.get(&pos)
    }

    /// Mutable access to the value stored at the position.
    pub fn get_mut(&mut self, pos: BlockPos) -> Option<&mut V> {
        self.entries.get_mut(&pos)
    }

    /// Whether a value is stored at the position.
    #[must_use]
    pub fn contains(&self, pos: BlockPos) -> bool {
        self.entries.contains_key(&pos)
    }

    /// Removes and returns the value stored at the position.
    pub fn remove(&mut self, pos: BlockPos) -> Option<V> {
        self.entries.remove(&pos)
    }

    /// Keeps only the entries for which the predicate holds.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(BlockPos, &V) -> bool,
    {
        self.entries.retain(|pos, value| keep(*pos, value));
    }

    /// Iterates over `(position, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (BlockPos, &V)> + '_ {
        self.entries.iter().map(|(pos, value)| (*pos, value))
    }

    /// Iterates over stored positions.
    pub fn positions(&self) -> impl Iterator<Item = BlockPos> + '_ {
        self.entries.keys().copied()
    }

    /// Entry API for in-place updates.
    pub fn entry(&mut self, pos: BlockPos) -> btree_map::Entry<'_, BlockPos, V> {
        self.entries.entry(pos)
    }

    /// Stores a value under a textual `x,y,z` key.
    pub fn insert_keyed(&mut self, key: &str, value: V) -> Result<Option<V>, CoreError> {
        let pos = BlockPos::parse_key(key)?;
        Ok(self.insert(pos, value))
    }

    /// Looks up a value by textual `x,y,z` key.
    pub fn get_keyed(&self, key: &str) -> Result<Option<&V>, CoreError> {
        let pos = BlockPos::parse_key(key)?;
        Ok(self.get(pos))
    }
}

impl<V> FromIterator<(BlockPos, V)> for PosMap<V> {
    fn from_iter<I: IntoIterator<Item = (BlockPos, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<V> IntoIterator for PosMap<V> {
    type Item = (BlockPos, V);
    type IntoIter = btree_map::IntoIter<BlockPos, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<V: Serialize> Serialize for PosMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries = self
            .entries
            .iter()
            .map(|(pos, value)| PosEntry {
                position: pos.to_array(),
                value,
            })
            .collect();
        Wire::PosMap(entries).serialize(serializer)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for PosMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Wire::<V>::deserialize(deserializer)?
            .into_pos_map()
            .map_err(de::Error::custom)?;
        Ok(entries
            .into_iter()
            .map(|entry| (BlockPos::from(entry.position), entry.value))
            .collect())
    }
}

/// Boolean cube over an inclusive integer range, packed one bit per cell.
///
/// Cell `(x, y, z)` maps to bit `dx + sx * (dy + sy * dz)` where `d*` are the
/// offsets from the minimum corner and `s*` the extents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisibilityGrid {
    min: BlockPos,
    max: BlockPos,
    bits: Vec<u8>,
}

impl VisibilityGrid {
    /// Creates an all-false grid covering `min..=max`.
    #[must_use]
    pub fn new(min: BlockPos, max: BlockPos) -> Self {
        let cells = Self::cell_count(min, max);
        Self {
            min,
            max,
            bits: vec![0; cells.div_ceil(8)],
        }
    }

    /// Inclusive minimum corner.
    #[must_use]
    pub const fn min(&self) -> BlockPos {
        self.min
    }

    /// Inclusive maximum corner.
    #[must_use]
    pub const fn max(&self) -> BlockPos {
        self.max
    }

    /// Marks a cell visible.
    pub fn add(&mut self, pos: BlockPos) -> Result<(), CoreError> {
        let index = self.index(pos).ok_or(CoreError::OutOfRange {
            pos,
            min: self.min,
            max: self.max,
        })?;
        self.bits[index / 8] |= 0x80 >> (index % 8);
        Ok(())
    }

    /// Whether a cell is marked. Cells outside the range are never marked.
    #[must_use]
    pub fn contains(&self, pos: BlockPos) -> bool {
        self.index(pos)
            .map(|index| self.bits[index / 8] & (0x80 >> (index % 8)) != 0)
            .unwrap_or(false)
    }

    /// Number of marked cells.
    #[must_use]
    pub fn count(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    /// Iterates over marked cells in index order.
    pub fn iter(&self) -> impl Iterator<Item = BlockPos> + '_ {
        let (sx, sy, _) = self.extents();
        let cells = Self::cell_count(self.min, self.max);
        (0..cells).filter_map(move |index| {
            if self.bits[index / 8] & (0x80 >> (index % 8)) == 0 {
                return None;
            }
            let x = index % sx;
            let y = (index / sx) % sy;
            let z = index / (sx * sy);
            Some(BlockPos::new(
                self.min.x() + x as i32,
                self.min.y() + y as i32,
                self.min.z() + z as i32,
            ))
        })
    }

    /// Packed bits encoded as standard padded base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bits)
    }

    /// Rebuilds a grid from its range and packed bits. Surplus trailing bits
    /// are ignored.
    pub fn from_base64(min: BlockPos, max: BlockPos, encoded: &str) -> Result<Self, CoreError> {
        let mut grid = Self::new(min, max);
        let decoded = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|error| CoreError::InvalidEncoding(error.to_string()))?;
        let cells = Self::cell_count(min, max);
        for (slot, byte) in grid.bits.iter_mut().zip(decoded) {
            *slot = byte;
        }
        if cells % 8 != 0 {
            if let Some(last) = grid.bits.last_mut() {
                *last &= 0xff << (8 - cells % 8);
            }
        }
        Ok(grid)
    }

    fn extents(&self) -> (usize, usize, usize) {
        Self::extents_of(self.min, self.max)
    }

    fn extents_of(min: BlockPos, max: BlockPos) -> (usize, usize, usize) {
        let span = |lo: i32, hi: i32| usize::try_from(i64::from(hi) - i64::from(lo) + 1).unwrap_or(0);
        (
            span(min.x(), max.x()),
            span(min.y(), max.y()),
            span(min.z(), max.z()),
        )
    }

    fn cell_count(min: BlockPos, max: BlockPos) -> usize {
        let (sx, sy, sz) = Self::extents_of(min, max);
        sx * sy * sz
    }

    fn index(&self, pos: BlockPos) -> Option<usize> {
        let inside = pos.x() >= self.min.x()
            && pos.x() <= self.max.x()
            && pos.y() >= self.min.y()
            && pos.y() <= self.max.y()
            && pos.z() >= self.min.z()
            && pos.z() <= self.max.z();
        if !inside {
            return None;
        }
        let (sx, sy, _) = self.extents();
        let dx = (pos.x() - self.min.x()) as usize;
        let dy = (pos.y() - self.min.y()) as usize;
        let dz = (pos.z() - self.min.z()) as usize;
        Some(dx + sx * (dy + sy * dz))
    }
}

impl Serialize for VisibilityGrid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Wire::<()>::Bitset(BitsetBody {
            range: [self.min, self.max],
            base64: self.to_base64(),
        })
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VisibilityGrid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let body = Wire::<()>::deserialize(deserializer)?
            .into_bitset()
            .map_err(de::Error::custom)?;
        Self::from_base64(body.range[0], body.range[1], &body.base64).map_err(de::Error::custom)
    }
}

/// Map keyed by tick, kept sorted by insertion-point search.
#[derive(Clone, Debug, PartialEq)]
pub struct TickMap<V> {
    entries: Vec<(Tick, V)>,
}

impl<V> Default for TickMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> TickMap<V> {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored ticks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no ticks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores a value at its sorted position, returning the one it replaced.
    pub fn insert(&mut self, tick: Tick, value: V) -> Option<V> {
        match self.entries.binary_search_by_key(&tick, |(key, _)| *key) {
            Ok(index) => Some(std::mem::replace(&mut self.entries[index].1, value)),
            Err(index) => {
                self.entries.insert(index, (tick, value));
                None
            }
        }
    }

    /// Value stored at the tick.
    #[must_use]
    pub fn get(&self, tick: Tick) -> Option<&V> {
        self.entries
            .binary_search_by_key(&tick, |(key, _)| *key)
            .ok()
            .map(|index| &self.entries[index].1)
    }

    /// Whether a value is stored at the tick.
    #[must_use]
    pub fn contains(&self, tick: Tick) -> bool {
        self.get(tick).is_some()
    }

    /// Earliest stored tick.
    #[must_use]
    pub fn first_tick(&self) -> Option<Tick> {
        self.entries.first().map(|(tick, _)| *tick)
    }

    /// Latest stored tick.
    #[must_use]
    pub fn last_tick(&self) -> Option<Tick> {
        self.entries.last().map(|(tick, _)| *tick)
    }

    /// Iterates over stored ticks in ascending order.
    pub fn ticks(&self) -> impl Iterator<Item = Tick> + '_ {
        self.entries.iter().map(|(tick, _)| *tick)
    }

    /// Iterates over `(tick, value)` pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (Tick, &V)> + '_ {
        self.entries.iter().map(|(tick, value)| (*tick, value))
    }

    /// Entries whose tick lies in `min..=max`.
    #[must_use]
    pub fn range(&self, min: Tick, max: Tick) -> &[(Tick, V)] {
        let (start, end) = self.bounds(min, max);
        &self.entries[start..end]
    }

    /// Ticks lying in `min..=max`.
    #[must_use]
    pub fn range_keys(&self, min: Tick, max: Tick) -> Vec<Tick> {
        self.range(min, max).iter().map(|(tick, _)| *tick).collect()
    }

    /// Serializable view of the entries in `min..=max`.
    #[must_use]
    pub fn slice(&self, min: Tick, max: Tick) -> TickSlice<'_, V> {
        TickSlice {
            entries: self.range(min, max),
        }
    }

    /// Combines independently produced maps. Sources are expected not to
    /// overlap; a tick present in several sources keeps the last one seen.
    #[must_use]
    pub fn merge<I>(sources: I) -> Self
    where
        I: IntoIterator<Item = TickMap<V>>,
    {
        let mut merged = Self::new();
        for source in sources {
            for (tick, value) in source.entries {
                let _ = merged.insert(tick, value);
            }
        }
        merged
    }

    fn bounds(&self, min: Tick, max: Tick) -> (usize, usize) {
        let start = self.entries.partition_point(|(tick, _)| *tick < min);
        let end = self.entries.partition_point(|(tick, _)| *tick <= max);
        (start, end.max(start))
    }
}

impl<V: DeserializeOwned> TickMap<V> {
    /// Parses and merges serialized tick maps such as consecutive history
    /// files.
    pub fn merge_serialized<S: AsRef<str>>(sources: &[S]) -> Result<Self, CoreError> {
        let mut parsed = Vec::with_capacity(sources.len());
        for source in sources {
            let map: TickMap<V> = serde_json::from_str(source.as_ref())
                .map_err(|error| CoreError::MalformedTickMap(error.to_string()))?;
            parsed.push(map);
        }
        Ok(Self::merge(parsed))
    }
}

impl<V> FromIterator<(Tick, V)> for TickMap<V> {
    fn from_iter<I: IntoIterator<Item = (Tick, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (tick, value) in iter {
            let _ = map.insert(tick, value);
        }
        map
    }
}

impl<V: Serialize> Serialize for TickMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TickSlice {
            entries: &self.entries,
        }
        .serialize(serializer)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for TickMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let TickEntries(entries) = Wire::<V>::deserialize(deserializer)?
            .into_tick_map()
            .map_err(de::Error::custom)?;
        Ok(entries.into_iter().collect())
    }
}

/// Borrowed run of tick map entries that serializes as a tick map.
#[derive(Debug)]
pub struct TickSlice<'a, V> {
    entries: &'a [(Tick, V)],
}

impl<V: Serialize> Serialize for TickSlice<'_, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let borrowed = self
            .entries
            .iter()
            .map(|(tick, value)| (*tick, value))
            .collect();
        Wire::TickMap(TickEntries(borrowed)).serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::{PosMap, TickMap, VisibilityGrid};
    use crate::{BlockPos, CoreError, Tick};

    fn grid() -> VisibilityGrid {
        VisibilityGrid::new(BlockPos::new(-1, 0, 2), BlockPos::new(1, 2, 4))
    }

    #[test]
    fn bitset_rejects_insertions_outside_range() {
        let mut grid = grid();
        let outside = BlockPos::new(2, 0, 2);
        assert_eq!(
            grid.add(outside),
            Err(CoreError::OutOfRange {
                pos: outside,
                min: BlockPos::new(-1, 0, 2),
                max: BlockPos::new(1, 2, 4),
            })
        );
        assert!(!grid.contains(outside));
    }

    #[test]
    fn bitset_reconstructs_exactly_from_base64() {
        let mut grid = grid();
        let marked = [
            BlockPos::new(-1, 0, 2),
            BlockPos::new(0, 1, 3),
            BlockPos::new(1, 2, 4),
        ];
        for pos in marked {
            grid.add(pos).expect("inside range");
        }
        let encoded = grid.to_base64();
        let restored =
            VisibilityGrid::from_base64(grid.min(), grid.max(), &encoded).expect("decode");
        assert_eq!(restored, grid);
        assert_eq!(restored.iter().collect::<Vec<_>>(), marked.to_vec());
        assert_eq!(restored.count(), 3);
    }

    #[test]
    fn bitset_packs_most_significant_bit_first() {
        let mut grid = VisibilityGrid::new(BlockPos::new(0, 0, 0), BlockPos::new(9, 0, 0));
        grid.add(BlockPos::new(0, 0, 0)).expect("inside");
        grid.add(BlockPos::new(9, 0, 0)).expect("inside");
        assert_eq!(grid.to_base64(), "gEA=");
    }

    #[test]
    fn bitset_serializes_with_tagged_range() {
        let mut grid = VisibilityGrid::new(BlockPos::new(0, 0, 0), BlockPos::new(1, 0, 0));
        grid.add(BlockPos::new(1, 0, 0)).expect("inside");
        let json = serde_json::to_string(&grid).expect("serialize");
        assert_eq!(
            json,
            r#"{"__Vec3BoolMap__":{"range":[{"__Vec3__":[0.0,0.0,0.0]},{"__Vec3__":[1.0,0.0,0.0]}],"base64":"QA=="}}"#
        );
        let restored: VisibilityGrid = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, grid);
    }

    #[test]
    fn pos_map_keys_must_be_coordinates() {
        let mut map = PosMap::new();
        assert!(map.insert_keyed("1,2", 0).is_err());
        assert_eq!(map.insert_keyed("1,2,3", 7), Ok(None));
        assert_eq!(map.get(BlockPos::new(1, 2, 3)), Some(&7));
    }

    #[test]
    fn pos_map_clone_is_value_isolated() {
        let mut original: PosMap<Vec<u32>> = PosMap::new();
        let _ = original.insert(BlockPos::new(0, 0, 0), vec![1]);
        let mut copy = original.clone();
        copy.get_mut(BlockPos::new(0, 0, 0)).expect("present").push(2);
        assert_eq!(original.get(BlockPos::new(0, 0, 0)), Some(&vec![1]));
    }

    #[test]
    fn pos_map_round_trips_through_json() {
        let mut map = PosMap::new();
        let _ = map.insert(
            BlockPos::new(3, -1, 0),
            serde_json::json!({"name": "stone"}),
        );
        let json = serde_json::to_string(&map).expect("serialize");
        assert_eq!(json, r#"{"__Vec3Map__":[{"position":[3,-1,0],"name":"stone"}]}"#);
        let restored: PosMap<serde_json::Value> = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, map);
    }

    #[test]
    fn tick_map_keeps_keys_sorted() {
        let mut map = TickMap::new();
        for tick in [5, 1, 3, 9, 7] {
            let _ = map.insert(Tick::new(tick), tick * 10);
        }
        assert_eq!(
            map.ticks().map(Tick::get).collect::<Vec<_>>(),
            vec![1, 3, 5, 7, 9]
        );
        assert_eq!(map.insert(Tick::new(3), 0), Some(30));
    }

    #[test]
    fn tick_map_ranges_are_inclusive() {
        let map: TickMap<i64> = [1, 3, 5, 7, 9]
            .into_iter()
            .map(|tick| (Tick::new(tick), tick))
            .collect();
        assert_eq!(
            map.range_keys(Tick::new(3), Tick::new(7)),
            vec![Tick::new(3), Tick::new(5), Tick::new(7)]
        );
        assert_eq!(
            map.range_keys(Tick::new(4), Tick::new(4)),
            Vec::<Tick>::new()
        );
        assert_eq!(
            map.range_keys(Tick::new(8), Tick::new(2)),
            Vec::<Tick>::new()
        );
    }

    #[test]
    fn merging_fragments_yields_the_union() {
        let first: TickMap<String> = [(Tick::new(0), "a".to_owned()), (Tick::new(1), "b".to_owned())]
            .into_iter()
            .collect();
        let second: TickMap<String> = [(Tick::new(4), "c".to_owned())].into_iter().collect();
        let sources = [
            serde_json::to_string(&second).expect("serialize"),
            serde_json::to_string(&first).expect("serialize"),
            r#"{"__SortedMap__":{}}"#.to_owned(),
        ];
        let merged: TickMap<String> = TickMap::merge_serialized(&sources).expect("merge");
        assert_eq!(
            merged.ticks().map(Tick::get).collect::<Vec<_>>(),
            vec![0, 1, 4]
        );
        assert_eq!(merged.get(Tick::new(4)).map(String::as_str), Some("c"));
    }

    #[test]
    fn tick_map_slices_serialize_only_the_range() {
        let map: TickMap<u8> = (0..5).map(|tick| (Tick::new(tick), tick as u8)).collect();
        let json = serde_json::to_string(&map.slice(Tick::new(3), Tick::new(i64::MAX))).expect("serialize");
        assert_eq!(json, r#"{"__SortedMap__":{"3":3,"4":4}}"#);
    }
}
