//! Tagged wire shapes used by checkpoint files.
//!
//! Coordinate maps, bounded bitsets, tick-sorted maps and vectors are written
//! as single-key objects whose key names the shape, so a reader can tell them
//! apart from plain objects. [`Wire`] is the closed set of those shapes; every
//! container encodes itself through one variant and refuses the others when
//! decoding.

use std::{collections::BTreeMap, fmt, marker::PhantomData};

use serde::{
    de::{MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};

use crate::{BlockPos, CoreError, Tick};

/// Key naming a coordinate map.
pub const POS_MAP_TAG: &str = "__Vec3Map__";
/// Key naming a bounded bitset.
pub const BITSET_TAG: &str = "__Vec3BoolMap__";
/// Key naming a tick-sorted map.
pub const TICK_MAP_TAG: &str = "__SortedMap__";
/// Key naming a 3D vector.
pub const VEC3_TAG: &str = "__Vec3__";

/// Closed union of tagged wire shapes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Wire<V> {
    /// Coordinate map written as a list of entries carrying their position.
    #[serde(rename = "__Vec3Map__")]
    PosMap(Vec<PosEntry<V>>),
    /// Bounded bitset written as its range plus packed bits.
    #[serde(rename = "__Vec3BoolMap__")]
    Bitset(BitsetBody),
    /// Tick-sorted map written as an object keyed by tick.
    #[serde(rename = "__SortedMap__")]
    TickMap(TickEntries<V>),
    /// Three-component vector.
    #[serde(rename = "__Vec3__")]
    Vec3([f64; 3]),
}

impl<V> Wire<V> {
    /// Tag identifying the shape of the value.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Wire::PosMap(_) => POS_MAP_TAG,
            Wire::Bitset(_) => BITSET_TAG,
            Wire::TickMap(_) => TICK_MAP_TAG,
            Wire::Vec3(_) => VEC3_TAG,
        }
    }

    /// Extracts coordinate map entries.
    pub fn into_pos_map(self) -> Result<Vec<PosEntry<V>>, CoreError> {
        match self {
            Wire::PosMap(entries) => Ok(entries),
            other => Err(other.mismatch(POS_MAP_TAG)),
        }
    }

    /// Extracts a bitset body.
    pub fn into_bitset(self) -> Result<BitsetBody, CoreError> {
        match self {
            Wire::Bitset(body) => Ok(body),
            other => Err(other.mismatch(BITSET_TAG)),
        }
    }

    /// Extracts tick map entries.
    pub fn into_tick_map(self) -> Result<TickEntries<V>, CoreError> {
        match self {
            Wire::TickMap(entries) => Ok(entries),
            other => Err(other.mismatch(TICK_MAP_TAG)),
        }
    }

    /// Extracts vector components.
    pub fn into_vec3(self) -> Result<[f64; 3], CoreError> {
        match self {
            Wire::Vec3(components) => Ok(components),
            other => Err(other.mismatch(VEC3_TAG)),
        }
    }

    fn mismatch(&self, expected: &'static str) -> CoreError {
        CoreError::UnexpectedShape {
            expected,
            found: self.tag(),
        }
    }
}

/// Coordinate map entry: the value's own fields plus its position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PosEntry<V> {
    /// Integer coordinate of the entry.
    pub position: [i32; 3],
    /// Value stored at the coordinate.
    #[serde(flatten)]
    pub value: V,
}

/// Bitset payload: inclusive range and MSB-first packed bits in base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitsetBody {
    /// Inclusive minimum and maximum corners.
    pub range: [BlockPos; 2],
    /// Packed bits, eight cells per byte, most significant bit first.
    pub base64: String,
}

/// Tick map payload, kept in the order it was written.
#[derive(Clone, Debug, PartialEq)]
pub struct TickEntries<V>(pub Vec<(Tick, V)>);

impl<V: Serialize> Serialize for TickEntries<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (tick, value) in &self.0 {
            map.serialize_entry(tick, value)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for TickEntries<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for EntriesVisitor<V> {
            type Value = TickEntries<V>;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("an object keyed by tick")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((tick, value)) = access.next_entry::<Tick, V>()? {
                    entries.push((tick, value));
                }
                Ok(TickEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

/// Untyped decoding of any tagged value, used by inspection tooling.
pub type AnyWire = Wire<serde_json::Value>;

/// Counts the entries held by each tagged shape found at the top level of a
/// JSON object.
#[must_use]
pub fn summarize(object: &serde_json::Map<String, serde_json::Value>) -> BTreeMap<String, String> {
    object
        .iter()
        .map(|(key, value)| {
            let summary = match serde_json::from_value::<AnyWire>(value.clone()) {
                Ok(Wire::PosMap(entries)) => format!("{POS_MAP_TAG} with {} entries", entries.len()),
                Ok(Wire::Bitset(body)) => format!(
                    "{BITSET_TAG} over {}..={}",
                    body.range[0], body.range[1]
                ),
                Ok(Wire::TickMap(entries)) => {
                    format!("{TICK_MAP_TAG} with {} ticks", entries.0.len())
                }
                Ok(Wire::Vec3(components)) => format!("{VEC3_TAG} {components:?}"),
                Err(_) => match value {
                    serde_json::Value::Object(inner) => format!("object with {} keys", inner.len()),
                    serde_json::Value::Array(items) => format!("array with {} items", items.len()),
                    other => other.to_string(),
                },
            };
            (key.clone(), summary)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{summarize, TickEntries, Wire, POS_MAP_TAG, VEC3_TAG};
    use crate::{CoreError, Tick};

    #[test]
    fn tick_entries_keep_written_order() {
        let json = r#"{"__SortedMap__":{"3":"c","1":"a"}}"#;
        let decoded: Wire<String> = serde_json::from_str(json).expect("decode");
        let entries = decoded.into_tick_map().expect("tick map");
        assert_eq!(
            entries,
            TickEntries(vec![(Tick::new(3), "c".to_owned()), (Tick::new(1), "a".to_owned())])
        );
    }

    #[test]
    fn decoding_the_wrong_shape_is_reported() {
        let decoded: Wire<()> = serde_json::from_str(r#"{"__Vec3__":[1.0,2.0,3.0]}"#).expect("decode");
        assert_eq!(
            decoded.into_pos_map().map(|entries| entries.len()),
            Err(CoreError::UnexpectedShape {
                expected: POS_MAP_TAG,
                found: VEC3_TAG,
            })
        );
    }

    #[test]
    fn summary_names_each_tagged_field() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{"blocks":{"__Vec3Map__":[{"position":[0,0,0],"name":"stone"}]},"status":{}}"#,
        )
        .expect("json");
        let object = value.as_object().expect("object");
        let summary = summarize(object);
        assert_eq!(summary["blocks"], "__Vec3Map__ with 1 entries");
        assert_eq!(summary["status"], "object with 0 keys");
    }
}
