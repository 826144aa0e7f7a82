use std::collections::{BTreeMap, BTreeSet};

use belief_nest_core::{Block, BlockPos, EnvBox, Point, PosMap};
use belief_nest_system_visibility::{VisibilityEngine, VisibilitySettings, DEFAULT_EYE_HEIGHT};
use belief_nest_world::ShapeCatalog;

fn engine(max_distance: f64, offset: BlockPos) -> VisibilityEngine {
    VisibilityEngine::new(
        VisibilitySettings {
            env_box: EnvBox::new(BlockPos::new(-8, -1, -8), BlockPos::new(12, 6, 8)),
            offset,
            max_distance,
            eye_height: DEFAULT_EYE_HEIGHT,
            extra_transparent: Vec::new(),
        },
        ShapeCatalog::standard(),
    )
}

fn two_agents() -> BTreeMap<String, Point> {
    [
        ("alice".to_owned(), Point::new(0.5, 0.0, 0.5)),
        ("bob".to_owned(), Point::new(5.5, 0.0, 0.5)),
    ]
    .into_iter()
    .collect()
}

fn sees(
    visibility: &BTreeMap<String, BTreeMap<String, bool>>,
    observer: &str,
    other: &str,
) -> bool {
    visibility[observer][other]
}

#[test]
fn agents_in_an_empty_world_see_each_other() {
    let visibility = engine(20.0, BlockPos::new(100, 64, -30)).player_visibility(
        &two_agents(),
        &PosMap::new(),
        &BTreeSet::new(),
    );
    assert!(sees(&visibility, "alice", "bob"));
    assert!(sees(&visibility, "bob", "alice"));
}

#[test]
fn a_full_block_between_the_eyes_hides_both_agents() {
    let mut blocks = PosMap::new();
    let _ = blocks.insert(BlockPos::new(3, 1, 0), Block::named("stone").with_state(1));
    let visibility = engine(20.0, BlockPos::new(100, 64, -30)).player_visibility(
        &two_agents(),
        &blocks,
        &BTreeSet::new(),
    );
    assert!(!sees(&visibility, "alice", "bob"));
    assert!(!sees(&visibility, "bob", "alice"));
}

#[test]
fn glass_does_not_occlude() {
    let mut blocks = PosMap::new();
    let _ = blocks.insert(BlockPos::new(3, 1, 0), Block::named("glass").with_state(7));
    let visibility =
        engine(20.0, BlockPos::default()).player_visibility(&two_agents(), &blocks, &BTreeSet::new());
    assert!(sees(&visibility, "alice", "bob"));
}

#[test]
fn thin_fence_posts_only_block_rays_that_hit_them() {
    let mut blocks = PosMap::new();
    let _ = blocks.insert(BlockPos::new(3, 1, 0), Block::named("oak_fence").with_state(8));
    let beside_post: BTreeMap<String, Point> = [
        ("alice".to_owned(), Point::new(0.5, 0.0, 0.1)),
        ("bob".to_owned(), Point::new(5.5, 0.0, 0.1)),
    ]
    .into_iter()
    .collect();
    let engine = engine(20.0, BlockPos::default());
    let visibility = engine.player_visibility(&beside_post, &blocks, &BTreeSet::new());
    assert!(sees(&visibility, "alice", "bob"));
    let visibility = engine.player_visibility(&two_agents(), &blocks, &BTreeSet::new());
    assert!(!sees(&visibility, "alice", "bob"));
}

#[test]
fn occluders_outside_one_window_make_visibility_asymmetric() {
    let mut blocks = PosMap::new();
    let _ = blocks.insert(BlockPos::new(4, 1, 0), Block::named("stone").with_state(1));
    let visibility =
        engine(3.0, BlockPos::default()).player_visibility(&two_agents(), &blocks, &BTreeSet::new());
    assert!(sees(&visibility, "alice", "bob"));
    assert!(!sees(&visibility, "bob", "alice"));
}

#[test]
fn non_existent_agents_are_invisible_both_ways() {
    let absent: BTreeSet<String> = ["bob".to_owned()].into_iter().collect();
    let visibility =
        engine(20.0, BlockPos::default()).player_visibility(&two_agents(), &PosMap::new(), &absent);
    assert!(!sees(&visibility, "alice", "bob"));
    assert!(!sees(&visibility, "bob", "alice"));

    let grids = engine(20.0, BlockPos::default()).block_visibility(
        &two_agents(),
        &PosMap::new(),
        &absent,
    );
    assert_eq!(grids["bob"].count(), 0);
    assert!(grids["alice"].count() > 0);
}

#[test]
fn blocks_behind_a_wall_are_hidden() {
    let mut blocks = PosMap::new();
    for y in 0..=4 {
        for z in -4..=4 {
            let _ = blocks.insert(BlockPos::new(2, y, z), Block::named("stone").with_state(1));
        }
    }
    let agents: BTreeMap<String, Point> = [("alice".to_owned(), Point::new(0.5, 0.0, 0.5))]
        .into_iter()
        .collect();
    let offset = BlockPos::new(-50, 10, 7);
    let grids = engine(6.0, offset).block_visibility(&agents, &blocks, &BTreeSet::new());
    let grid = &grids["alice"];
    assert!(grid.contains(BlockPos::new(1, 1, 0)));
    assert!(grid.contains(BlockPos::new(2, 1, 0)));
    assert!(!grid.contains(BlockPos::new(4, 1, 0)));
    assert!(grid.min().x() >= -8 && grid.max().x() <= 12);
}

#[test]
fn targets_on_the_window_edge_are_not_reported_blocked() {
    let agents: BTreeMap<String, Point> = [("alice".to_owned(), Point::new(0.5, 0.0, 0.5))]
        .into_iter()
        .collect();
    let grids =
        engine(4.2, BlockPos::default()).block_visibility(&agents, &PosMap::new(), &BTreeSet::new());
    let grid = &grids["alice"];
    assert_eq!(grid.max().x(), 4);
    assert!(grid.contains(BlockPos::new(4, 1, 0)));
}
