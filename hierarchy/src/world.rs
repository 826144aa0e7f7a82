//! One node of the belief world tree.

use std::{collections::BTreeMap, fs, future::Future, pin::Pin, sync::Arc};

use belief_nest_core::{
    validate_name, BeliefPath, BlockPatch, BlockPos, BranchPath, ContainerPatch, ItemCounts,
    Point, Tick, EQUIPMENT_SLOTS, INITIAL_TICK,
};
use belief_nest_system_observation::{
    checkpoint::{self, FileKind},
    DumpOptions, Mode, ObservationManager, OverwriteOutcome, StopOptions, UpstreamPort,
};
use belief_nest_world::{ConnectionRegistry, ExecutionOutcome, GameWorld, WorldAddress};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    player::{AgentKind, AgentPlayer},
    worker::{AgentWorker, WorkerSpec},
    HierarchyError, WorldConfig,
};

/// Longest game name the server accepts.
pub const GAME_NAME_LIMIT: usize = 16;

const RESERVED_NAMES: [&str; 2] = ["operator", "world"];

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How an agent enters a belief world.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinOptions {
    /// Agent name inside the world.
    pub agent_name: String,
    /// Who controls the agent.
    pub kind: AgentKind,
    /// Starting position relative to the world's offset.
    pub position: Option<Point>,
    /// Starting inventory.
    pub inventory: Option<ItemCounts>,
    /// Starting item per equipment slot.
    pub equipment: Option<Vec<Option<String>>>,
}

impl JoinOptions {
    /// A bot joining wherever the server spawns it, with nothing in hand.
    #[must_use]
    pub fn bot(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            kind: AgentKind::Bot,
            position: None,
            inventory: None,
            equipment: None,
        }
    }

    /// A human already connected to the server.
    #[must_use]
    pub fn human(agent_name: impl Into<String>) -> Self {
        Self {
            kind: AgentKind::Human,
            ..Self::bot(agent_name)
        }
    }

    /// Places the agent at a position relative to the world's offset.
    #[must_use]
    pub fn at(mut self, position: Point) -> Self {
        self.position = Some(position);
        self
    }
}

/// Where a child world lives.
#[derive(Clone, Debug, PartialEq)]
pub struct ChildOptions {
    /// Offset of the child world inside the game world.
    pub offset: BlockPos,
    /// Prefix of the child world's game names.
    pub player_prefix: String,
    /// Game server hosting the child world.
    pub address: WorldAddress,
    /// Start replaying the parent right away.
    pub start_follow: bool,
}

/// Observation state of a world and its descendants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimStatus {
    /// Branch label of the world.
    pub branch_label: String,
    /// Selected mode, if any.
    pub mode: Option<String>,
    /// Whether the scheduler runs.
    pub active: bool,
    /// Live tick.
    pub tick: Tick,
    /// Status of each child world, by owning agent.
    pub children: BTreeMap<String, SimStatus>,
}

#[derive(Clone)]
pub(crate) struct WorldContext {
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) config: Arc<WorldConfig>,
}

pub(crate) struct Placement {
    pub(crate) lineage: BeliefPath,
    pub(crate) branch: BranchPath,
    pub(crate) offset: BlockPos,
    pub(crate) player_prefix: String,
    pub(crate) address: WorldAddress,
}

/// A simulated world: its admin, its agents and their observation records.
///
/// Agents may own a child world holding what they believe; the tree is owned
/// downwards and children only reach their parent through the replication
/// channel of their observation manager.
pub struct BeliefWorld {
    lineage: BeliefPath,
    branch: BranchPath,
    offset: BlockPos,
    player_prefix: String,
    address: WorldAddress,
    context: WorldContext,
    world: Arc<dyn GameWorld>,
    admin: AgentPlayer,
    players: BTreeMap<String, AgentPlayer>,
    manager: ObservationManager,
}

impl std::fmt::Debug for BeliefWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeliefWorld")
            .field("belief_path", &self.lineage)
            .field("branch", &self.branch)
            .field("offset", &self.offset)
            .field("players", &self.players)
            .finish_non_exhaustive()
    }
}

impl BeliefWorld {
    pub(crate) async fn create(
        context: WorldContext,
        placement: Placement,
        upstream: Option<UpstreamPort>,
    ) -> Result<Self, HierarchyError> {
        let Placement {
            lineage,
            branch,
            offset,
            player_prefix,
            address,
        } = placement;
        let config = Arc::clone(&context.config);
        let branch_dir = branch.directory(&config.ckpt_dir, &lineage)?;
        let world = context.registry.acquire(&address, &lineage).await?;
        let admin_name = &config.admin_agent_name;
        let admin = match AgentPlayer::admin(
            admin_name,
            &format!("{player_prefix}{admin_name}"),
            Arc::clone(&world),
        )
        .await
        {
            Ok(admin) => admin,
            Err(error) => {
                if let Err(release) = context.registry.release(&address, &lineage).await {
                    warn!(belief_path = %lineage, %release, "failed to release world connection");
                }
                return Err(error);
            }
        };
        let manager = ObservationManager::new(
            Arc::clone(&world),
            config.manager_settings(offset),
            branch_dir,
            upstream,
        );
        info!(belief_path = %lineage, %branch, %address, "belief world created");
        Ok(Self {
            lineage,
            branch,
            offset,
            player_prefix,
            address,
            context,
            world,
            admin,
            players: BTreeMap::new(),
            manager,
        })
    }

    /// Agent names leading to this world from the root.
    #[must_use]
    pub fn belief_path(&self) -> &BeliefPath {
        &self.lineage
    }

    /// Timeline this world records to.
    #[must_use]
    pub fn branch(&self) -> &BranchPath {
        &self.branch
    }

    /// Offset of the world inside the game world.
    #[must_use]
    pub const fn offset(&self) -> BlockPos {
        self.offset
    }

    /// Observation manager of the world.
    #[must_use]
    pub fn manager(&self) -> &ObservationManager {
        &self.manager
    }

    /// The world's admin.
    #[must_use]
    pub fn admin(&self) -> &AgentPlayer {
        &self.admin
    }

    /// An agent of the world.
    #[must_use]
    pub fn player(&self, agent: &str) -> Option<&AgentPlayer> {
        self.players.get(agent)
    }

    /// Names of the world's agents.
    #[must_use]
    pub fn agent_names(&self) -> Vec<String> {
        self.players.keys().cloned().collect()
    }

    pub(crate) fn child(&self, agent: &str) -> Result<&BeliefWorld, HierarchyError> {
        self.players
            .get(agent)
            .ok_or_else(|| HierarchyError::AgentNotFound(agent.to_owned()))?
            .child
            .as_deref()
            .ok_or_else(|| HierarchyError::NoChildWorld(agent.to_owned()))
    }

    pub(crate) fn child_mut(&mut self, agent: &str) -> Result<&mut BeliefWorld, HierarchyError> {
        self.players
            .get_mut(agent)
            .ok_or_else(|| HierarchyError::AgentNotFound(agent.to_owned()))?
            .child
            .as_deref_mut()
            .ok_or_else(|| HierarchyError::NoChildWorld(agent.to_owned()))
    }

    fn children(&self) -> impl Iterator<Item = &BeliefWorld> {
        self.players
            .values()
            .filter_map(|player| player.child.as_deref())
    }

    /// Adds an agent to the world.
    pub async fn join(&mut self, options: JoinOptions) -> Result<(), HierarchyError> {
        let game_name = self.add_player(&options).await?;
        self.update_agent_info().await?;
        self.admin.set_transparency(&game_name, false).await?;
        info!(belief_path = %self.lineage, agent = %options.agent_name, kind = ?options.kind, "agent joined");
        Ok(())
    }

    async fn add_player(&mut self, options: &JoinOptions) -> Result<String, HierarchyError> {
        let name = options.agent_name.as_str();
        validate_name(name)?;
        if RESERVED_NAMES.contains(&name) || name == self.context.config.admin_agent_name {
            return Err(HierarchyError::ReservedName(name.to_owned()));
        }
        if self.players.contains_key(name) {
            return Err(HierarchyError::DuplicateName(name.to_owned()));
        }
        let game_name = format!("{}{name}", self.player_prefix);
        if game_name.chars().count() > GAME_NAME_LIMIT {
            return Err(HierarchyError::NameTooLong {
                name: game_name,
                limit: GAME_NAME_LIMIT,
            });
        }
        let connected = self.world.player_names().await.contains(&game_name);

        let player = match options.kind {
            AgentKind::Bot => {
                if connected {
                    return Err(HierarchyError::DuplicateName(game_name));
                }
                let status = self.manager.status();
                let spec = WorkerSpec {
                    agent_name: name.to_owned(),
                    game_name: game_name.clone(),
                    world: Arc::clone(&self.world),
                    broker: self.manager.broker().clone(),
                    sampling: status.active && status.mode == Some(Mode::Observe),
                    ready_timeout: self.context.config.worker_ready_timeout(),
                };
                let worker =
                    AgentWorker::start(&spec, self.context.config.worker_retry_limit).await?;
                AgentPlayer::bot(name, &game_name, Arc::clone(&self.world), worker)
            }
            AgentKind::Human => {
                if !self.lineage.is_root() {
                    return Err(HierarchyError::HumanOnlyInRoot(name.to_owned()));
                }
                if !connected {
                    return Err(HierarchyError::HumanNotConnected(game_name));
                }
                AgentPlayer::human(name, &game_name, Arc::clone(&self.world))
            }
        };

        if let Err(error) = self.equip(&game_name, options).await {
            if let Err(close) = player.close().await {
                warn!(agent = %name, %close, "failed to close agent after a failed join");
            }
            return Err(error);
        }
        let _ = self.players.insert(name.to_owned(), player);
        Ok(game_name)
    }

    async fn equip(&self, game_name: &str, options: &JoinOptions) -> Result<(), HierarchyError> {
        if let Some(position) = options.position {
            self.admin
                .teleport(game_name, position.shifted(self.offset))
                .await?;
        }
        if options.inventory.is_some() || options.equipment.is_some() {
            let inventory = options.inventory.clone().unwrap_or_default();
            let equipment = options
                .equipment
                .clone()
                .unwrap_or_else(|| vec![None; EQUIPMENT_SLOTS]);
            self.world
                .set_inventory_and_equipment(game_name, &inventory, &equipment)
                .await?;
        }
        Ok(())
    }

    /// Removes an agent, closing its child world first.
    pub async fn leave(&mut self, agent: &str) -> Result<(), HierarchyError> {
        let player = self
            .players
            .remove(agent)
            .ok_or_else(|| HierarchyError::AgentNotFound(agent.to_owned()))?;
        let had_child = player.child.is_some();
        player.close().await?;
        if had_child {
            self.manager.detach_child(agent)?;
        }
        self.update_agent_info().await?;
        info!(belief_path = %self.lineage, agent, "agent left");
        Ok(())
    }

    /// Shares the agent directory with the manager and every worker.
    async fn update_agent_info(&self) -> Result<(), HierarchyError> {
        let agents: BTreeMap<String, String> = self
            .players
            .iter()
            .map(|(agent, player)| (agent.clone(), player.game_name().to_owned()))
            .collect();
        self.manager.set_agents(agents.clone());
        for player in self.players.values() {
            player.update_agent_info(&agents).await?;
        }
        debug!(belief_path = %self.lineage, agents = agents.len(), "agent info updated");
        Ok(())
    }

    /// Runs an agent program on behalf of an agent.
    pub async fn execute(
        &self,
        agent: &str,
        program: &str,
    ) -> Result<ExecutionOutcome, HierarchyError> {
        self.players
            .get(agent)
            .ok_or_else(|| HierarchyError::AgentNotFound(agent.to_owned()))?
            .execute(program)
            .await
    }

    /// Creates the world `agent` believes in, seeded from the agent's initial
    /// subjective state and joined by shadows of every agent of this world.
    pub async fn create_child(
        &mut self,
        agent: &str,
        options: ChildOptions,
    ) -> Result<(), HierarchyError> {
        let player = self
            .players
            .get(agent)
            .ok_or_else(|| HierarchyError::AgentNotFound(agent.to_owned()))?;
        if player.child.is_some() {
            return Err(HierarchyError::ChildWorldExists(agent.to_owned()));
        }

        let lineage = self.lineage.child(agent);
        let branch = self.branch.child_follow();
        let child_dir = branch.directory(&self.context.config.ckpt_dir, &lineage)?;
        fs::create_dir_all(&child_dir).map_err(|error| HierarchyError::io(&child_dir, error))?;
        let seed = checkpoint::file_path(&child_dir, "", FileKind::State, INITIAL_TICK);
        if !seed.exists() {
            let source = checkpoint::file_path(
                &checkpoint::internal_dir(&self.manager.branch_dir()),
                &checkpoint::agent_prefix(agent),
                FileKind::State,
                INITIAL_TICK,
            );
            let _ = fs::copy(&source, &seed).map_err(|error| HierarchyError::io(&source, error))?;
        }

        let upstream = self.manager.attach_child(agent);
        let placement = Placement {
            lineage,
            branch,
            offset: options.offset,
            player_prefix: options.player_prefix,
            address: options.address,
        };
        let mut child = match Self::create(self.context.clone(), placement, Some(upstream)).await {
            Ok(child) => child,
            Err(error) => {
                let _ = self.manager.detach_child(agent);
                return Err(error);
            }
        };
        let shadows = self.agent_names();
        if let Err(error) = child.populate(&shadows, options.start_follow).await {
            let _ = self.manager.detach_child(agent);
            if let Err(close) = child.close().await {
                warn!(agent, %close, "failed to close a half-built child world");
            }
            return Err(error);
        }
        info!(belief_path = %self.lineage, agent, "child world created");
        if let Some(player) = self.players.get_mut(agent) {
            player.child = Some(Box::new(child));
        }
        Ok(())
    }

    async fn populate(&mut self, agents: &[String], start_follow: bool) -> Result<(), HierarchyError> {
        for agent in agents {
            let _ = self.add_player(&JoinOptions::bot(agent.clone())).await?;
        }
        self.update_agent_info().await?;
        for player in self.players.values() {
            self.admin
                .set_transparency(player.game_name(), false)
                .await?;
        }
        self.manager.load(true).await?;
        if start_follow {
            self.start_follow(false).await?;
        }
        Ok(())
    }

    /// Closes the child world of `agent`.
    pub async fn remove_child(&mut self, agent: &str) -> Result<(), HierarchyError> {
        let player = self
            .players
            .get_mut(agent)
            .ok_or_else(|| HierarchyError::AgentNotFound(agent.to_owned()))?;
        let child = player
            .child
            .take()
            .ok_or_else(|| HierarchyError::NoChildWorld(agent.to_owned()))?;
        self.manager.detach_child(agent)?;
        (*child).close().await?;
        info!(belief_path = %self.lineage, agent, "child world removed");
        Ok(())
    }

    /// Starts sampling the game world.
    pub fn start_observation(&self) -> Result<(), HierarchyError> {
        self.manager.switch_mode(Mode::Observe)?;
        self.manager.start()?;
        Ok(())
    }

    /// Stops sampling the game world.
    pub async fn stop_observation(&self) -> Result<(), HierarchyError> {
        self.require_mode(Mode::Observe, "stop_observation")?;
        self.manager.stop(StopOptions::default()).await?;
        Ok(())
    }

    /// Starts replaying the parent world, and with `recursive` every
    /// descendant too.
    pub fn start_follow(&self, recursive: bool) -> BoxFuture<'_, Result<(), HierarchyError>> {
        Box::pin(async move {
            self.manager.switch_mode(Mode::Follow)?;
            self.manager.start()?;
            if recursive {
                for child in self.children() {
                    child.start_follow(true).await?;
                }
            }
            Ok(())
        })
    }

    /// Stops replaying the parent world. With `recursive`, following
    /// descendants are stopped first.
    pub async fn stop_follow(&self, recursive: bool, force: bool) -> Result<(), HierarchyError> {
        if recursive {
            self.stop_following_children(force).await?;
        }
        self.require_mode(Mode::Follow, "stop_follow")?;
        self.manager.stop(StopOptions {
            strict: false,
            force,
        })
        .await?;
        Ok(())
    }

    pub(crate) fn stop_following_children(
        &self,
        force: bool,
    ) -> BoxFuture<'_, Result<(), HierarchyError>> {
        Box::pin(async move {
            for child in self.children() {
                child.stop_following_children(force).await?;
                let status = child.manager.status();
                if status.active && status.mode == Some(Mode::Follow) {
                    child
                        .manager
                        .stop(StopOptions {
                            strict: false,
                            force,
                        })
                        .await?;
                }
            }
            Ok(())
        })
    }

    fn require_mode(&self, mode: Mode, operation: &str) -> Result<(), HierarchyError> {
        match self.manager.status().mode {
            Some(current) if current == mode => Ok(()),
            current => Err(HierarchyError::WrongMode(format!(
                "{operation} needs {mode} mode, world is in {}",
                current.map_or("no", Mode::label)
            ))),
        }
    }

    /// Stops sampling, dumps and resumes when it was running and `stop` is
    /// not set.
    pub(crate) async fn dump_observed(&self, stop: bool) -> Result<Tick, HierarchyError> {
        let was_active = self.manager.status().active;
        self.manager.stop(StopOptions::default()).await?;
        let tick = self.manager.dump(DumpOptions::default()).await?;
        if was_active && !stop {
            self.manager.start()?;
        }
        Ok(tick)
    }

    /// Follows up to `end` and dumps there, then does the same for every
    /// following descendant when `recursive`.
    pub(crate) fn dump_following(
        &self,
        end: Tick,
        recursive: bool,
        stop: bool,
    ) -> BoxFuture<'_, Result<Tick, HierarchyError>> {
        Box::pin(async move {
            self.manager.set_stop_follow_tick(end);
            self.manager.switch_mode(Mode::Follow)?;
            self.manager.start()?;
            let tick = self
                .manager
                .dump(DumpOptions {
                    end_tick: Some(end),
                    stop,
                    overwrite: false,
                })
                .await?;
            if recursive {
                self.dump_following_children(tick, stop).await?;
            }
            Ok(tick)
        })
    }

    pub(crate) async fn dump_following_children(
        &self,
        end: Tick,
        stop: bool,
    ) -> Result<(), HierarchyError> {
        for child in self.children() {
            if child.manager.status().mode == Some(Mode::Follow) {
                let _ = child.dump_following(end, true, stop).await?;
            }
        }
        Ok(())
    }

    /// Reloads the newest checkpoint and rebuilds the game world from it,
    /// and with `recursive` every descendant too.
    pub fn load_observation(&self, recursive: bool) -> BoxFuture<'_, Result<(), HierarchyError>> {
        Box::pin(async move {
            self.manager.load(true).await?;
            if recursive {
                for child in self.children() {
                    child.load_observation(true).await?;
                }
            }
            Ok(())
        })
    }

    /// Re-points this world and its descendants at another branch, copying
    /// the current checkpoints there on first use.
    pub(crate) fn switch_branch(
        &mut self,
        branch: BranchPath,
    ) -> BoxFuture<'_, Result<(), HierarchyError>> {
        Box::pin(async move {
            self.manager.stop(StopOptions::default()).await?;
            let from = self.manager.branch_dir();
            let to = branch.directory(&self.context.config.ckpt_dir, &self.lineage)?;
            if !to.exists() {
                checkpoint::copy_branch(&from, &to)?;
                info!(belief_path = %self.lineage, %branch, "branch created");
            }
            self.branch = branch;
            self.manager.update_branch_dir(to).await?;
            let child_branch = self.branch.child_follow();
            for player in self.players.values_mut() {
                if let Some(child) = player.child.as_deref_mut() {
                    child.switch_branch(child_branch.clone()).await?;
                }
            }
            Ok(())
        })
    }

    /// Restarts follow in every descendant on a follow branch.
    pub(crate) fn restart_following_children(&self) -> BoxFuture<'_, Result<(), HierarchyError>> {
        Box::pin(async move {
            for child in self.children() {
                if child.branch.is_follow() {
                    child.start_follow(false).await?;
                }
                child.restart_following_children().await?;
            }
            Ok(())
        })
    }

    /// Patches objective memory and the game world.
    pub async fn overwrite_state(
        &self,
        blocks: &[BlockPatch],
        containers: &[ContainerPatch],
    ) -> OverwriteOutcome {
        self.manager.overwrite_state(blocks, containers).await
    }

    /// Observation state of this world and its descendants.
    #[must_use]
    pub fn sim_status(&self) -> SimStatus {
        let status = self.manager.status();
        SimStatus {
            branch_label: self.branch.last().to_owned(),
            mode: status.mode.map(|mode| mode.label().to_owned()),
            active: status.active,
            tick: status.tick,
            children: self
                .players
                .iter()
                .filter_map(|(agent, player)| {
                    Some((agent.clone(), player.child.as_deref()?.sim_status()))
                })
                .collect(),
        }
    }

    /// Closes every agent and child world, clears the world's box and
    /// releases the shared connection.
    pub fn close(self) -> BoxFuture<'static, Result<(), HierarchyError>> {
        Box::pin(async move {
            let Self {
                lineage,
                address,
                context,
                admin,
                players,
                manager,
                offset,
                ..
            } = self;
            let mut first_error = None;
            let mut keep = |result: Result<(), HierarchyError>| {
                if let Err(error) = result {
                    error!(belief_path = %lineage, %error, "failed to close part of a belief world");
                    let _ = first_error.get_or_insert(error);
                }
            };

            keep(manager.close().await.map_err(HierarchyError::from));
            for (agent, player) in players {
                let had_child = player.child.is_some();
                keep(player.close().await);
                if had_child {
                    keep(manager.detach_child(&agent).map_err(HierarchyError::from));
                }
            }
            keep(admin.clear_box(context.config.env_box().shifted(offset)).await);
            keep(admin.close().await);
            keep(
                context
                    .registry
                    .release(&address, &lineage)
                    .await
                    .map_err(HierarchyError::from),
            );
            info!(belief_path = %lineage, "belief world closed");
            first_error.map_or(Ok(()), Err)
        })
    }
}
