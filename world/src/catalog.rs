//! Physical block shapes used for occlusion.

use std::collections::{BTreeMap, BTreeSet};

use belief_nest_core::{Block, Point};

const TRANSPARENT_BLOCKS: [&str; 5] = ["glass", "tinted_glass", "glass_pane", "barrier", "ice"];

/// Axis-aligned box in block-local coordinates, `0..=1` for a full cube.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShapeBox {
    /// Minimum corner.
    pub min: Point,
    /// Maximum corner.
    pub max: Point,
}

impl ShapeBox {
    /// Creates a box from `[xmin, ymin, zmin, xmax, ymax, zmax]`.
    #[must_use]
    pub const fn from_bounds(bounds: [f64; 6]) -> Self {
        Self {
            min: Point::new(bounds[0], bounds[1], bounds[2]),
            max: Point::new(bounds[3], bounds[4], bounds[5]),
        }
    }

    /// Unit cube.
    #[must_use]
    pub const fn full() -> Self {
        Self::from_bounds([0.0, 0.0, 0.0, 1.0, 1.0, 1.0])
    }

    /// Same box with its top lowered to at most `height`.
    #[must_use]
    pub fn clipped(&self, height: f64) -> Self {
        Self {
            min: self.min,
            max: Point::new(self.max.x(), self.max.y().min(height), self.max.z()),
        }
    }
}

/// Resolved block state.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockState {
    /// Block type name.
    pub name: String,
    /// Whether the state is an open gate or door.
    pub open: bool,
    /// Collision boxes of the state.
    pub shapes: Vec<ShapeBox>,
}

/// What a block does to a ray crossing its cell.
#[derive(Clone, Debug, PartialEq)]
pub enum Occluder {
    /// The whole cell blocks.
    Full,
    /// Only the listed boxes block.
    Shapes(Vec<ShapeBox>),
}

/// Lookup from block state ids and names to physical shapes.
#[derive(Clone, Debug, Default)]
pub struct ShapeCatalog {
    states: BTreeMap<u32, BlockState>,
    defaults: BTreeMap<String, u32>,
    non_colliding: BTreeSet<String>,
}

impl ShapeCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog covering the blocks used by the bundled worlds.
    #[must_use]
    pub fn standard() -> Self {
        let mut catalog = Self::new();
        for name in [
            "air",
            "cave_air",
            "void_air",
            "short_grass",
            "torch",
            "poppy",
            "water",
            "lever",
        ] {
            catalog.register_non_colliding(name);
        }
        let full = vec![ShapeBox::full()];
        let post = vec![ShapeBox::from_bounds([0.375, 0.0, 0.375, 0.625, 1.5, 0.625])];
        let gate = vec![ShapeBox::from_bounds([0.0, 0.0, 0.375, 1.0, 1.5, 0.625])];
        let wall = vec![ShapeBox::from_bounds([0.25, 0.0, 0.25, 0.75, 1.5, 0.75])];
        let slab = vec![ShapeBox::from_bounds([0.0, 0.0, 0.0, 1.0, 0.5, 1.0])];
        let chest = vec![ShapeBox::from_bounds([0.0625, 0.0, 0.0625, 0.9375, 0.875, 0.9375])];
        let none = Vec::new();
        let entries: [(u32, &str, bool, &Vec<ShapeBox>); 13] = [
            (1, "stone", false, &full),
            (2, "dirt", false, &full),
            (3, "grass_block", false, &full),
            (4, "bedrock", false, &full),
            (5, "oak_planks", false, &full),
            (6, "cobblestone", false, &full),
            (7, "glass", false, &full),
            (8, "oak_fence", false, &post),
            (9, "oak_fence_gate", false, &gate),
            (11, "cobblestone_wall", false, &wall),
            (12, "stone_slab", false, &slab),
            (13, "chest", false, &chest),
            (14, "lever", false, &none),
        ];
        for (state_id, name, open, shapes) in entries {
            catalog.register(
                state_id,
                BlockState {
                    name: name.to_owned(),
                    open,
                    shapes: shapes.clone(),
                },
            );
        }
        catalog.register_variant(
            10,
            BlockState {
                name: "oak_fence_gate".to_owned(),
                open: true,
                shapes: Vec::new(),
            },
        );
        catalog
    }

    /// Adds a state and makes it the default for its name.
    pub fn register(&mut self, state_id: u32, state: BlockState) {
        let _ = self.defaults.insert(state.name.clone(), state_id);
        let _ = self.states.insert(state_id, state);
    }

    /// Adds a state without changing the default for its name.
    pub fn register_variant(&mut self, state_id: u32, state: BlockState) {
        let _ = self.defaults.entry(state.name.clone()).or_insert(state_id);
        let _ = self.states.insert(state_id, state);
    }

    /// Marks a block type as having no collision box.
    pub fn register_non_colliding(&mut self, name: &str) {
        let _ = self.non_colliding.insert(name.to_owned());
    }

    /// State registered under the id.
    #[must_use]
    pub fn state(&self, state_id: u32) -> Option<&BlockState> {
        self.states.get(&state_id)
    }

    /// Default state id of a block type.
    #[must_use]
    pub fn default_state(&self, name: &str) -> Option<u32> {
        self.defaults.get(name).copied()
    }

    /// Whether rays pass through the block type because it has no collision.
    #[must_use]
    pub fn is_non_colliding(&self, name: &str) -> bool {
        self.non_colliding.contains(name)
    }

    /// Whether the block type lets light through.
    #[must_use]
    pub fn is_transparent(name: &str, extra: &[String]) -> bool {
        TRANSPARENT_BLOCKS.contains(&name)
            || extra.iter().any(|candidate| candidate == name)
            || name.ends_with("_stained_glass")
            || name.ends_with("_stained_glass_pane")
    }

    /// Whether the block takes part in occlusion at all.
    #[must_use]
    pub fn occludes(&self, block: &Block, extra_transparent: &[String]) -> bool {
        !self.is_non_colliding(&block.name) && !Self::is_transparent(&block.name, extra_transparent)
    }

    /// Shapes a block presents to rays. Walls, fences and closed fence gates
    /// are clipped to one block in height. Unknown states and states without
    /// boxes block the whole cell.
    #[must_use]
    pub fn occluder(&self, block: &Block) -> Occluder {
        let Some(state) = block.state_id.and_then(|id| self.state(id)) else {
            return Occluder::Full;
        };
        if state.shapes.is_empty() {
            return Occluder::Full;
        }
        let tall = state.name.ends_with("_wall")
            || state.name.ends_with("_fence")
            || (state.name.ends_with("_fence_gate") && !state.open);
        if tall {
            Occluder::Shapes(state.shapes.iter().map(|shape| shape.clipped(1.0)).collect())
        } else {
            Occluder::Shapes(state.shapes.clone())
        }
    }
}
