use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use belief_nest_core::{EnvBox, Point};
use belief_nest_world::{teleport_and_wait, ExecutionOutcome, GameWorld, WaitPolicy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{worker::AgentWorker, BeliefWorld, HierarchyError};

const TELEPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Who controls an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Driven by agent programs through a worker.
    Bot,
    /// Played by a person already connected to the server.
    Human,
}

/// A participant of a belief world.
///
/// The admin is the privileged, invisible participant every world has. It
/// is the only one allowed to reshape the world and move other players.
pub struct AgentPlayer {
    agent_name: String,
    game_name: String,
    kind: AgentKind,
    admin: bool,
    world: Arc<dyn GameWorld>,
    worker: Option<AgentWorker>,
    pub(crate) child: Option<Box<BeliefWorld>>,
}

impl fmt::Debug for AgentPlayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentPlayer")
            .field("agent_name", &self.agent_name)
            .field("game_name", &self.game_name)
            .field("kind", &self.kind)
            .field("admin", &self.admin)
            .field("has_child", &self.child.is_some())
            .finish()
    }
}

impl AgentPlayer {
    /// Connects the admin of a world and hides it.
    pub(crate) async fn admin(
        agent_name: &str,
        game_name: &str,
        world: Arc<dyn GameWorld>,
    ) -> Result<Self, HierarchyError> {
        world.connect_player(game_name).await?;
        let admin = Self {
            agent_name: agent_name.to_owned(),
            game_name: game_name.to_owned(),
            kind: AgentKind::Bot,
            admin: true,
            world,
            worker: None,
            child: None,
        };
        admin.set_transparency(game_name, true).await?;
        Ok(admin)
    }

    pub(crate) fn bot(
        agent_name: &str,
        game_name: &str,
        world: Arc<dyn GameWorld>,
        worker: AgentWorker,
    ) -> Self {
        Self {
            agent_name: agent_name.to_owned(),
            game_name: game_name.to_owned(),
            kind: AgentKind::Bot,
            admin: false,
            world,
            worker: Some(worker),
            child: None,
        }
    }

    pub(crate) fn human(agent_name: &str, game_name: &str, world: Arc<dyn GameWorld>) -> Self {
        Self {
            agent_name: agent_name.to_owned(),
            game_name: game_name.to_owned(),
            kind: AgentKind::Human,
            admin: false,
            world,
            worker: None,
            child: None,
        }
    }

    /// Name inside the belief world.
    #[must_use]
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Name on the game server.
    #[must_use]
    pub fn game_name(&self) -> &str {
        &self.game_name
    }

    /// Who controls the agent.
    #[must_use]
    pub const fn kind(&self) -> AgentKind {
        self.kind
    }

    /// Whether this is the world's admin.
    #[must_use]
    pub const fn is_admin(&self) -> bool {
        self.admin
    }

    /// The world this agent imagines, if any.
    #[must_use]
    pub fn child(&self) -> Option<&BeliefWorld> {
        self.child.as_deref()
    }

    fn privileged(&self, operation: &'static str) -> Result<&dyn GameWorld, HierarchyError> {
        if self.admin {
            Ok(self.world.as_ref())
        } else {
            Err(HierarchyError::NotAdmin {
                operation,
                agent: self.agent_name.clone(),
            })
        }
    }

    /// Hides or reveals a player.
    pub async fn set_transparency(
        &self,
        game_name: &str,
        transparent: bool,
    ) -> Result<(), HierarchyError> {
        self.privileged("set_transparency")?
            .set_transparency(game_name, transparent)
            .await?;
        Ok(())
    }

    /// Moves a player and waits until it arrives.
    pub async fn teleport(&self, game_name: &str, to: Point) -> Result<(), HierarchyError> {
        let world = self.privileged("teleport")?;
        teleport_and_wait(world, game_name, to, WaitPolicy::strict(TELEPORT_TIMEOUT)).await?;
        Ok(())
    }

    /// Empties a box of the game world.
    pub async fn clear_box(&self, env_box: EnvBox) -> Result<(), HierarchyError> {
        self.privileged("clear_box")?.clear_box(env_box).await?;
        Ok(())
    }

    /// Runs an agent program.
    pub async fn execute(&self, program: &str) -> Result<ExecutionOutcome, HierarchyError> {
        match &self.worker {
            Some(worker) => worker.execute(program).await,
            None if self.admin => Err(HierarchyError::ReservedName(self.agent_name.clone())),
            None => Err(HierarchyError::HumanControlled(self.agent_name.clone())),
        }
    }

    pub(crate) async fn update_agent_info(
        &self,
        agents: &BTreeMap<String, String>,
    ) -> Result<(), HierarchyError> {
        match &self.worker {
            Some(worker) => worker.update_agent_info(agents.clone()).await,
            None => Ok(()),
        }
    }

    /// Closes the child world, then the worker.
    pub(crate) async fn close(mut self) -> Result<(), HierarchyError> {
        if let Some(child) = self.child.take() {
            (*child).close().await?;
        }
        match self.worker.take() {
            Some(worker) => worker.close().await?,
            None if self.admin => self.world.disconnect_player(&self.game_name).await?,
            None => {}
        }
        debug!(agent = %self.agent_name, "player closed");
        Ok(())
    }
}
