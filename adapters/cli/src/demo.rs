use std::{fs, path::Path, sync::Arc};

use anyhow::Context;
use belief_nest_core::{BeliefPath, BlockPatch, BlockPos, BranchPath, Point, INITIAL_TICK};
use belief_nest_hierarchy::{BeliefNest, ChildOptions, JoinOptions, SimStatus, WorldConfig};
use belief_nest_system_observation::checkpoint;
use belief_nest_system_record::ObservationRecord;
use belief_nest_world::{VoxelConnector, VoxelWorld};
use tracing::info;

const FLOOR_DEPTH: i32 = 5;

fn agent_position(index: usize) -> Point {
    Point::new(2.5 + 2.0 * index as f64, 1.0, 2.5)
}

/// Writes a bedrock floor under the agents as the initial state of a branch
/// that has none.
fn seed_initial_state(config: &WorldConfig, branch_dir: &Path, agents: usize) -> anyhow::Result<()> {
    let existing = checkpoint::file_path(branch_dir, "", checkpoint::FileKind::State, INITIAL_TICK);
    if existing.is_file() {
        return Ok(());
    }
    fs::create_dir_all(branch_dir)
        .with_context(|| format!("failed to create {}", branch_dir.display()))?;
    let width = 2 * agents as i32 + 4;
    let floor: Vec<BlockPatch> = (0..width)
        .flat_map(|x| (0..FLOOR_DEPTH).map(move |z| [x, 0, z]))
        .map(|position| BlockPatch {
            position,
            name: Some("bedrock".to_owned()),
            properties: None,
        })
        .collect();
    let mut record = ObservationRecord::new_objective(config.observation.position_memory);
    record.overwrite_state(&floor, &[]);
    checkpoint::dump_initial_state(&record, branch_dir, "")?;
    info!(branch_dir = %branch_dir.display(), blocks = floor.len(), "initial state written");
    Ok(())
}

/// Opens a nest on an in-memory world, lets `agents` join the root, gives
/// the first of them a following child world, observes `ticks` ticks and
/// dumps the whole tree. Returns the status of the tree after the dump.
pub(crate) async fn run(
    config: WorldConfig,
    agents: &[String],
    ticks: u32,
    child_offset_x: i32,
) -> anyhow::Result<SimStatus> {
    let root = BeliefPath::root();
    let root_dir = BranchPath::root().directory(&config.ckpt_dir, &root)?;
    seed_initial_state(&config, &root_dir, agents.len())?;

    let address = config.address();
    let world = Arc::new(VoxelWorld::new());
    let mut nest = BeliefNest::open(config, Arc::new(VoxelConnector::shared(world))).await?;
    for (index, agent) in agents.iter().enumerate() {
        nest.join(&root, JoinOptions::bot(agent.as_str()).at(agent_position(index)))
            .await
            .with_context(|| format!("{agent} could not join"))?;
    }
    nest.load_observation(&root, false).await?;
    if let Some(first) = agents.first() {
        let options = ChildOptions {
            offset: BlockPos::new(child_offset_x, 0, 0),
            player_prefix: format!("{first}_"),
            address,
            start_follow: true,
        };
        nest.create_child_sim(&root, first, options).await?;
    }

    nest.start_observation(&root)?;
    for _ in 0..ticks {
        nest.root().manager().observe_now().await?;
    }
    let tick = nest.dump_observation(root.clone(), true, false).await?;
    info!(tick = %tick, dir = %root_dir.display(), "demo nest dumped");

    let status = nest.sim_status(&root)?;
    nest.close().await?;
    Ok(status)
}
