use belief_nest_core::{Block, BlockPos, PosMap};
use belief_nest_world::{Occluder, ShapeCatalog};
use glam::DVec3;

/// Bounded window of absolute cells around an observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Window {
    min: BlockPos,
    max: BlockPos,
}

impl Window {
    /// Window spanning `eye ± reach` on every axis, clamped to `[lower, upper]`.
    pub(crate) fn around(eye: DVec3, reach: f64, lower: BlockPos, upper: BlockPos) -> Self {
        let axis = |eye: f64, lo: i32, hi: i32| -> (i32, i32) {
            let (lo, hi) = (f64::from(lo), f64::from(hi));
            let min = (eye - reach).max(lo).min(hi).floor() as i32;
            let max = (eye + reach).min(hi).max(lo).floor() as i32;
            (min, max)
        };
        let (min_x, max_x) = axis(eye.x, lower.x(), upper.x());
        let (min_y, max_y) = axis(eye.y, lower.y(), upper.y());
        let (min_z, max_z) = axis(eye.z, lower.z(), upper.z());
        Self {
            min: BlockPos::new(min_x, min_y, min_z),
            max: BlockPos::new(max_x, max_y, max_z),
        }
    }

    pub(crate) const fn min(&self) -> BlockPos {
        self.min
    }

    pub(crate) const fn max(&self) -> BlockPos {
        self.max
    }

    fn size(&self) -> [i64; 3] {
        [
            i64::from(self.max.x()) - i64::from(self.min.x()) + 1,
            i64::from(self.max.y()) - i64::from(self.min.y()) + 1,
            i64::from(self.max.z()) - i64::from(self.min.z()) + 1,
        ]
    }

    /// Every absolute cell of the window.
    pub(crate) fn cells(&self) -> impl Iterator<Item = BlockPos> {
        let (min, max) = (self.min, self.max);
        (min.x()..=max.x()).flat_map(move |x| {
            (min.y()..=max.y())
                .flat_map(move |y| (min.z()..=max.z()).map(move |z| BlockPos::new(x, y, z)))
        })
    }
}

/// Occluding cells of a window with the shapes each one presents.
#[derive(Debug)]
pub(crate) struct OccupancyGrid {
    window: Window,
    size: [i64; 3],
    cells: Vec<Option<Occluder>>,
}

impl OccupancyGrid {
    /// Collects occluders from relative block memory translated by `offset`.
    pub(crate) fn build(
        window: Window,
        blocks: &PosMap<Block>,
        offset: BlockPos,
        catalog: &ShapeCatalog,
        extra_transparent: &[String],
    ) -> Self {
        let size = window.size();
        let capacity = usize::try_from(size[0] * size[1] * size[2]).unwrap_or(0);
        let mut grid = Self {
            window,
            size,
            cells: vec![None; capacity],
        };
        for (pos, block) in blocks.iter() {
            if !catalog.occludes(block, extra_transparent) {
                continue;
            }
            let absolute = pos.offset(offset);
            let local = [
                i64::from(absolute.x()) - i64::from(window.min.x()),
                i64::from(absolute.y()) - i64::from(window.min.y()),
                i64::from(absolute.z()) - i64::from(window.min.z()),
            ];
            if let Some(index) = grid.index(local) {
                grid.cells[index] = Some(catalog.occluder(block));
            }
        }
        grid
    }

    fn index(&self, local: [i64; 3]) -> Option<usize> {
        let inside = local
            .iter()
            .zip(self.size)
            .all(|(coordinate, extent)| *coordinate >= 0 && *coordinate < extent);
        if !inside {
            return None;
        }
        usize::try_from(local[0] + self.size[0] * (local[1] + self.size[1] * local[2])).ok()
    }

    /// Whether the segment from `from` to `to` reaches the target cell
    /// without crossing an occluding shape. The starting cell is never tested
    /// and leaving the window counts as visible.
    pub(crate) fn ray_visible(&self, from: DVec3, to: DVec3) -> bool {
        let delta = to - from;
        let length = delta.length();
        if length == 0.0 {
            return true;
        }
        let dir = delta / length;
        let origin = DVec3::new(
            f64::from(self.window.min.x()),
            f64::from(self.window.min.y()),
            f64::from(self.window.min.z()),
        );

        let start = from.floor();
        let mut cell = to_local(start - origin);
        let target = to_local(to.floor() - origin);
        if cell == target {
            return true;
        }

        let step = [sign(dir.x), sign(dir.y), sign(dir.z)];
        let boundary = |voxel: f64, step: i64| voxel + if step > 0 { 1.0 } else { 0.0 };
        let crossing = |d: f64, voxel: f64, step: i64, o: f64| {
            if d == 0.0 {
                f64::INFINITY
            } else {
                (boundary(voxel, step) - o) / d
            }
        };
        let mut t_max = [
            crossing(dir.x, start.x, step[0], from.x),
            crossing(dir.y, start.y, step[1], from.y),
            crossing(dir.z, start.z, step[2], from.z),
        ];
        let t_delta = [
            (1.0 / dir.x).abs(),
            (1.0 / dir.y).abs(),
            (1.0 / dir.z).abs(),
        ];

        loop {
            let axis = if t_max[0] < t_max[1] {
                if t_max[0] < t_max[2] {
                    0
                } else {
                    2
                }
            } else if t_max[1] < t_max[2] {
                1
            } else {
                2
            };
            cell[axis] += step[axis];
            t_max[axis] += t_delta[axis];

            let Some(index) = self.index(cell) else {
                return true;
            };
            if cell == target {
                return true;
            }
            match &self.cells[index] {
                None => {}
                Some(Occluder::Full) => return false,
                Some(Occluder::Shapes(shapes)) => {
                    let corner = origin + DVec3::new(cell[0] as f64, cell[1] as f64, cell[2] as f64);
                    let hit = shapes.iter().any(|shape| {
                        let min = corner + DVec3::from_array(shape.min.to_array());
                        let max = corner + DVec3::from_array(shape.max.to_array());
                        segment_hits_box(from, dir, min, max, length)
                    });
                    if hit {
                        return false;
                    }
                }
            }
        }
    }
}

fn sign(component: f64) -> i64 {
    if component > 0.0 {
        1
    } else {
        -1
    }
}

fn to_local(offset: DVec3) -> [i64; 3] {
    [offset.x as i64, offset.y as i64, offset.z as i64]
}

/// Slab test of the ray `origin + t * dir`, `t` in `[0, length]`, against a box.
fn segment_hits_box(origin: DVec3, dir: DVec3, min: DVec3, max: DVec3, length: f64) -> bool {
    let mut t_min = 0.0_f64;
    let mut t_max = length;
    for axis in 0..3 {
        let (o, d, lo, hi) = (origin[axis], dir[axis], min[axis], max[axis]);
        if d == 0.0 {
            if o < lo || o > hi {
                return false;
            }
            continue;
        }
        let t1 = (lo - o) / d;
        let t2 = (hi - o) / d;
        t_min = t_min.max(t1.min(t2));
        t_max = t_max.min(t1.max(t2));
        if t_min > t_max {
            return false;
        }
    }
    t_max >= 0.0 && t_min <= length
}

#[cfg(test)]
mod tests {
    use super::{segment_hits_box, OccupancyGrid, Window};
    use belief_nest_core::{Block, BlockPos, PosMap};
    use belief_nest_world::ShapeCatalog;
    use glam::DVec3;

    fn window() -> Window {
        Window::around(
            DVec3::new(0.5, 1.5, 0.5),
            20.0,
            BlockPos::new(-4, 0, -4),
            BlockPos::new(8, 4, 4),
        )
    }

    #[test]
    fn windows_are_clamped_to_bounds() {
        let window = Window::around(
            DVec3::new(0.5, 1.62, 0.5),
            3.0,
            BlockPos::new(-1, 0, -10),
            BlockPos::new(10, 10, 10),
        );
        assert_eq!(window.min(), BlockPos::new(-1, 0, -3));
        assert_eq!(window.max(), BlockPos::new(3, 4, 3));
    }

    #[test]
    fn slab_test_respects_segment_length() {
        let min = DVec3::new(2.0, 0.0, 0.0);
        let max = DVec3::new(3.0, 1.0, 1.0);
        let origin = DVec3::new(0.0, 0.5, 0.5);
        assert!(segment_hits_box(origin, DVec3::X, min, max, 5.0));
        assert!(!segment_hits_box(origin, DVec3::X, min, max, 1.5));
        assert!(!segment_hits_box(origin, DVec3::NEG_X, min, max, 5.0));
    }

    #[test]
    fn full_blocks_stop_rays_and_slabs_do_not_at_eye_level() {
        let catalog = ShapeCatalog::standard();
        let mut blocks = PosMap::new();
        let _ = blocks.insert(BlockPos::new(3, 1, 0), Block::named("stone_slab").with_state(12));
        let grid = OccupancyGrid::build(window(), &blocks, BlockPos::default(), &catalog, &[]);
        let from = DVec3::new(0.5, 1.62, 0.5);
        assert!(grid.ray_visible(from, DVec3::new(6.5, 1.62, 0.5)));

        let _ = blocks.insert(BlockPos::new(3, 1, 0), Block::named("stone").with_state(1));
        let grid = OccupancyGrid::build(window(), &blocks, BlockPos::default(), &catalog, &[]);
        assert!(!grid.ray_visible(from, DVec3::new(6.5, 1.62, 0.5)));
    }

    #[test]
    fn leaving_the_window_counts_as_visible() {
        let catalog = ShapeCatalog::standard();
        let mut blocks = PosMap::new();
        let _ = blocks.insert(BlockPos::new(10, 1, 0), Block::named("stone").with_state(1));
        let grid = OccupancyGrid::build(window(), &blocks, BlockPos::default(), &catalog, &[]);
        assert!(grid.ray_visible(DVec3::new(0.5, 1.62, 0.5), DVec3::new(12.5, 1.62, 0.5)));
    }
}
