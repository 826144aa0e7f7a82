#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Line-of-sight visibility between agents and from agents to voxels.
//!
//! Every observer gets a window of `eye ± max_distance` cells clamped to the
//! belief world's bounds. Occluding blocks inside the window are rasterised
//! into an occupancy grid, and rays are traced through it with a 3D DDA that
//! tests the shapes of every occupied cell it crosses. Agents listed as non
//! existent neither see nor are seen.

mod grid;

use std::collections::{BTreeMap, BTreeSet};

use belief_nest_core::{Block, BlockPos, EnvBox, PlayerVisibility, Point, PosMap, VisibilityGrid};
use belief_nest_world::ShapeCatalog;
use glam::DVec3;

use crate::grid::{OccupancyGrid, Window};

/// Default reach of sight in blocks.
pub const DEFAULT_MAX_DISTANCE: f64 = 20.0;

/// Default eye height above the feet.
pub const DEFAULT_EYE_HEIGHT: f64 = 1.62;

const FACE_INSET: f64 = 0.01;
const FACE_SAMPLES: [[f64; 2]; 5] = [[0.5, 0.5], [0.01, 0.01], [0.01, 0.99], [0.99, 0.01], [0.99, 0.99]];

/// Geometry of the belief world the engine traces rays in.
#[derive(Clone, Debug, PartialEq)]
pub struct VisibilitySettings {
    /// Bounds of the belief world, relative to its offset.
    pub env_box: EnvBox,
    /// Translation from belief-world to world-absolute coordinates.
    pub offset: BlockPos,
    /// Reach of sight in blocks.
    pub max_distance: f64,
    /// Height of the eyes above the feet.
    pub eye_height: f64,
    /// Block types treated as see-through in addition to the glass family.
    pub extra_transparent: Vec<String>,
}

/// Computes what each agent can see.
#[derive(Clone, Debug)]
pub struct VisibilityEngine {
    settings: VisibilitySettings,
    catalog: ShapeCatalog,
}

impl VisibilityEngine {
    /// Creates an engine for a belief world.
    #[must_use]
    pub fn new(settings: VisibilitySettings, catalog: ShapeCatalog) -> Self {
        Self { settings, catalog }
    }

    /// Settings the engine was created with.
    #[must_use]
    pub fn settings(&self) -> &VisibilitySettings {
        &self.settings
    }

    /// Whether each agent sees each other agent.
    ///
    /// `positions` holds relative feet positions. Pairs involving an agent in
    /// `non_existent` are invisible both ways.
    #[must_use]
    pub fn player_visibility(
        &self,
        positions: &BTreeMap<String, Point>,
        blocks: &PosMap<Block>,
        non_existent: &BTreeSet<String>,
    ) -> BTreeMap<String, PlayerVisibility> {
        let mut visibility = BTreeMap::new();
        for (observer, position) in positions {
            let eye = self.eye(*position);
            let mut seen = PlayerVisibility::new();
            let mut grid = None;
            for (other, other_position) in positions {
                if other == observer {
                    continue;
                }
                let visible = if non_existent.contains(observer) || non_existent.contains(other) {
                    false
                } else {
                    let grid = grid.get_or_insert_with(|| self.occupancy(eye, blocks));
                    grid.ray_visible(eye, self.eye(*other_position))
                };
                let _ = seen.insert(other.clone(), visible);
            }
            let _ = visibility.insert(observer.clone(), seen);
        }
        visibility
    }

    /// Cells each agent sees, in relative coordinates.
    ///
    /// A cell is visible when a ray reaches its center or one of five sample
    /// points on any face turned towards the observer. Cells whose center is
    /// farther than the reach are skipped. Non-existent agents see nothing.
    #[must_use]
    pub fn block_visibility(
        &self,
        positions: &BTreeMap<String, Point>,
        blocks: &PosMap<Block>,
        non_existent: &BTreeSet<String>,
    ) -> BTreeMap<String, VisibilityGrid> {
        let mut visibility = BTreeMap::new();
        let mut targets = Vec::with_capacity(1 + 3 * FACE_SAMPLES.len());
        for (agent, position) in positions {
            let eye = self.eye(*position);
            let window = self.window(eye);
            let mut visible = VisibilityGrid::new(
                window.min().minus(self.settings.offset),
                window.max().minus(self.settings.offset),
            );
            if !non_existent.contains(agent) {
                let grid = OccupancyGrid::build(
                    window,
                    blocks,
                    self.settings.offset,
                    &self.catalog,
                    &self.settings.extra_transparent,
                );
                for cell in window.cells() {
                    let corner = to_dvec(cell);
                    let center = corner + DVec3::splat(0.5);
                    if eye.distance(center) > self.settings.max_distance {
                        continue;
                    }
                    candidate_points(eye, corner, &mut targets);
                    if targets.iter().any(|target| grid.ray_visible(eye, *target)) {
                        // the window always lies inside the grid's range
                        let _ = visible.add(cell.minus(self.settings.offset));
                    }
                }
            }
            let _ = visibility.insert(agent.clone(), visible);
        }
        visibility
    }

    fn eye(&self, feet: Point) -> DVec3 {
        let absolute = feet.shifted(self.settings.offset);
        DVec3::new(
            absolute.x(),
            absolute.y() + self.settings.eye_height,
            absolute.z(),
        )
    }

    fn window(&self, eye: DVec3) -> Window {
        let bounds = self.settings.env_box.shifted(self.settings.offset);
        Window::around(eye, self.settings.max_distance, bounds.min(), bounds.max())
    }

    fn occupancy(&self, eye: DVec3, blocks: &PosMap<Block>) -> OccupancyGrid {
        OccupancyGrid::build(
            self.window(eye),
            blocks,
            self.settings.offset,
            &self.catalog,
            &self.settings.extra_transparent,
        )
    }
}

fn to_dvec(pos: BlockPos) -> DVec3 {
    DVec3::new(f64::from(pos.x()), f64::from(pos.y()), f64::from(pos.z()))
}

/// Center of the cell followed by five points just inside every face that
/// the eye looks at.
fn candidate_points(eye: DVec3, corner: DVec3, out: &mut Vec<DVec3>) {
    out.clear();
    out.push(corner + DVec3::splat(0.5));
    for axis in 0..3 {
        let (face, inset) = if corner[axis] > eye[axis] {
            (corner[axis], FACE_INSET)
        } else if eye[axis] > corner[axis] + 1.0 {
            (corner[axis] + 1.0, -FACE_INSET)
        } else {
            continue;
        };
        let (u, v) = match axis {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        };
        for [a, b] in FACE_SAMPLES {
            let mut point = corner;
            point[axis] = face + inset;
            point[u] = corner[u] + a;
            point[v] = corner[v] + b;
            out.push(point);
        }
    }
}
