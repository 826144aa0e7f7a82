use std::sync::Arc;

use belief_nest_core::{
    validate_name, BeliefPath, BlockPatch, BlockPos, BranchPath, ContainerPatch, Tick,
};
use belief_nest_system_observation::{Mode, ObservationError, OverwriteOutcome, StopOptions};
use belief_nest_world::{ConnectionRegistry, ExecutionOutcome, WorldConnector};
use tracing::info;

use crate::{
    world::{BoxFuture, Placement, WorldContext},
    BeliefWorld, ChildOptions, HierarchyError, JoinOptions, SimStatus, WorldConfig,
};

/// The root belief world and everything nested below it, addressed by
/// belief path.
#[derive(Debug)]
pub struct BeliefNest {
    root: BeliefWorld,
    registry: Arc<ConnectionRegistry>,
}

impl BeliefNest {
    /// Creates the root world, connecting through `connector`.
    pub async fn open(
        config: WorldConfig,
        connector: Arc<dyn WorldConnector>,
    ) -> Result<Self, HierarchyError> {
        let registry = Arc::new(ConnectionRegistry::new(connector));
        let placement = Placement {
            lineage: BeliefPath::root(),
            branch: BranchPath::root(),
            offset: BlockPos::from(config.offset),
            player_prefix: config.player_prefix.clone(),
            address: config.address(),
        };
        let context = WorldContext {
            registry: Arc::clone(&registry),
            config: Arc::new(config),
        };
        let root = BeliefWorld::create(context, placement, None).await?;
        Ok(Self { root, registry })
    }

    /// The root world.
    #[must_use]
    pub fn root(&self) -> &BeliefWorld {
        &self.root
    }

    /// Shared connections of the tree.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// The world at `path`.
    pub fn world(&self, path: &BeliefPath) -> Result<&BeliefWorld, HierarchyError> {
        path.segments()
            .iter()
            .try_fold(&self.root, |world, agent| world.child(agent))
    }

    /// The world at `path`, mutably.
    pub fn world_mut(&mut self, path: &BeliefPath) -> Result<&mut BeliefWorld, HierarchyError> {
        path.segments()
            .iter()
            .try_fold(&mut self.root, |world, agent| world.child_mut(agent))
    }

    /// Adds an agent to the world at `path`.
    pub async fn join(
        &mut self,
        path: &BeliefPath,
        options: JoinOptions,
    ) -> Result<(), HierarchyError> {
        self.world_mut(path)?.join(options).await
    }

    /// Removes an agent from the world at `path`.
    pub async fn leave(&mut self, path: &BeliefPath, agent: &str) -> Result<(), HierarchyError> {
        self.world_mut(path)?.leave(agent).await
    }

    /// Runs an agent program in the world at `path`.
    pub async fn execute(
        &self,
        path: &BeliefPath,
        agent: &str,
        program: &str,
    ) -> Result<ExecutionOutcome, HierarchyError> {
        self.world(path)?.execute(agent, program).await
    }

    /// Creates the child world of `agent` inside the world at `path`.
    pub async fn create_child_sim(
        &mut self,
        path: &BeliefPath,
        agent: &str,
        options: ChildOptions,
    ) -> Result<(), HierarchyError> {
        self.world_mut(path)?.create_child(agent, options).await
    }

    /// Closes the world at `path`, which must not be the root.
    pub async fn remove_child_sim(&mut self, path: &BeliefPath) -> Result<(), HierarchyError> {
        let (agent, parent) = split_child(path)?;
        self.world_mut(&parent)?.remove_child(&agent).await
    }

    /// Starts observing in the world at `path`.
    pub fn start_observation(&self, path: &BeliefPath) -> Result<(), HierarchyError> {
        self.world(path)?.start_observation()
    }

    /// Stops observing in the world at `path`.
    pub async fn stop_observation(&self, path: &BeliefPath) -> Result<(), HierarchyError> {
        self.world(path)?.stop_observation().await
    }

    /// Starts following in the world at `path`.
    pub async fn start_follow(
        &self,
        path: &BeliefPath,
        recursive: bool,
    ) -> Result<(), HierarchyError> {
        self.world(path)?.start_follow(recursive).await
    }

    /// Stops following in the world at `path`.
    pub async fn stop_follow(
        &self,
        path: &BeliefPath,
        recursive: bool,
        force: bool,
    ) -> Result<(), HierarchyError> {
        self.world(path)?.stop_follow(recursive, force).await
    }

    /// Dumps the world at `path` and returns the tick written.
    ///
    /// An observing world is stopped, dumped and resumed unless `stop`. A
    /// following world first has its parent dumped and then follows up to
    /// the parent's tick before dumping. With `recursive`, following
    /// descendants are stopped beforehand and dumped at the same tick
    /// afterwards.
    pub fn dump_observation(
        &self,
        path: BeliefPath,
        recursive: bool,
        stop: bool,
    ) -> BoxFuture<'_, Result<Tick, HierarchyError>> {
        Box::pin(async move {
            let world = self.world(&path)?;
            if recursive {
                world.stop_following_children(false).await?;
            }
            let status = world.manager().status();
            let tick = match status.mode {
                Some(Mode::Observe) => world.dump_observed(stop).await?,
                Some(Mode::Follow) => {
                    if !status.active {
                        return Err(HierarchyError::WrongMode(
                            "dumping a following world needs follow to run".to_owned(),
                        ));
                    }
                    world.manager().stop(StopOptions::default()).await?;
                    let parent = path.parent().ok_or(ObservationError::NoParent)?;
                    let end = self.dump_observation(parent, false, false).await?;
                    world.dump_following(end, false, stop).await?
                }
                None => {
                    return Err(HierarchyError::WrongMode(
                        "dumping needs an observation mode".to_owned(),
                    ))
                }
            };
            if recursive {
                world.dump_following_children(tick, stop).await?;
            }
            info!(belief_path = %path, tick = %tick, recursive, "observation dumped");
            Ok(tick)
        })
    }

    /// Reloads the world at `path` from its newest checkpoint.
    pub async fn load_observation(
        &self,
        path: &BeliefPath,
        recursive: bool,
    ) -> Result<(), HierarchyError> {
        self.world(path)?.load_observation(recursive).await
    }

    /// Moves the world at `path` to the branch `branch_name`, creating it
    /// from the current checkpoints on first use.
    ///
    /// The world resumes following when the branch is `follow` and switches
    /// to observe mode otherwise; following descendants are restarted.
    pub async fn switch_branch(
        &mut self,
        path: &BeliefPath,
        branch_name: &str,
    ) -> Result<(), HierarchyError> {
        validate_name(branch_name)?;
        let _ = self.dump_observation(path.clone(), true, true).await?;
        let world = self.world_mut(path)?;
        let mut labels = world.branch().labels().to_vec();
        let _ = labels.pop();
        labels.push(branch_name.to_owned());
        let branch = BranchPath::new(labels)?;
        world.switch_branch(branch).await?;
        if world.branch().is_follow() {
            world.start_follow(false).await?;
        } else {
            world.manager().switch_mode(Mode::Observe)?;
        }
        world.restart_following_children().await?;
        info!(belief_path = %path, branch = %world.branch(), "branch switched");
        Ok(())
    }

    /// Patches the world at `path`.
    pub async fn overwrite_state(
        &self,
        path: &BeliefPath,
        blocks: &[BlockPatch],
        containers: &[ContainerPatch],
    ) -> Result<OverwriteOutcome, HierarchyError> {
        Ok(self.world(path)?.overwrite_state(blocks, containers).await)
    }

    /// Status tree rooted at the world at `path`.
    pub fn sim_status(&self, path: &BeliefPath) -> Result<SimStatus, HierarchyError> {
        Ok(self.world(path)?.sim_status())
    }

    /// Closes the whole tree.
    pub async fn close(self) -> Result<(), HierarchyError> {
        self.root.close().await
    }
}

fn split_child(path: &BeliefPath) -> Result<(String, BeliefPath), HierarchyError> {
    match (path.segments().last(), path.parent()) {
        (Some(agent), Some(parent)) => Ok((agent.clone(), parent)),
        _ => Err(HierarchyError::NoChildWorld(path.to_string())),
    }
}
