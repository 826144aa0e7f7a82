//! Per-agent worker tasks.
//!
//! Every bot runs in its own tokio task. The owning world talks to it only
//! through the command inbox; answers come back on a oneshot channel per
//! command. While the world observes, the worker reports what its agent did
//! to the observation manager in batches.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use belief_nest_core::{Event, EventKind};
use belief_nest_system_observation::{AgentBroker, AgentVitals, EventBatch, SamplingSignal};
use belief_nest_world::{ExecutionOutcome, GameWorld, WorldError};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::HierarchyError;

const COMMAND_CAPACITY: usize = 32;
const BATCH_PERIOD: Duration = Duration::from_millis(50);

enum Command {
    Execute {
        program: String,
        reply: oneshot::Sender<Result<ExecutionOutcome, WorldError>>,
    },
    UpdateAgentInfo {
        agents: BTreeMap<String, String>,
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<Result<(), WorldError>>,
    },
}

/// What a worker needs to come up.
#[derive(Clone)]
pub(crate) struct WorkerSpec {
    pub(crate) agent_name: String,
    pub(crate) game_name: String,
    pub(crate) world: Arc<dyn GameWorld>,
    pub(crate) broker: AgentBroker,
    pub(crate) sampling: bool,
    pub(crate) ready_timeout: Duration,
}

/// Handle of a running agent worker.
pub(crate) struct AgentWorker {
    game_name: String,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl AgentWorker {
    /// Starts a worker, trying again up to `attempts` times.
    pub(crate) async fn start(spec: &WorkerSpec, attempts: u32) -> Result<Self, HierarchyError> {
        let attempts = attempts.max(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match Self::spawn(spec.clone()).await {
                Ok(worker) => {
                    info!(agent = %spec.agent_name, game_name = %spec.game_name, "agent worker ready");
                    return Ok(worker);
                }
                Err(error) => reason = error,
            }
            if attempt < attempts {
                warn!(agent = %spec.agent_name, attempt, %reason, "agent worker failed to start, trying again");
            }
        }
        Err(HierarchyError::WorkerCreation {
            agent: spec.game_name.clone(),
            attempts,
            reason,
        })
    }

    async fn spawn(spec: WorkerSpec) -> Result<Self, String> {
        let (commands, inbox) = mpsc::channel(COMMAND_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let game_name = spec.game_name.clone();
        let wait = spec.ready_timeout;
        let task = tokio::spawn(run(spec, inbox, ready_tx));
        match time::timeout(wait, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(Self {
                game_name,
                commands,
                task,
            }),
            Ok(Ok(Err(error))) => Err(error.to_string()),
            Ok(Err(_)) => Err("worker exited before it was ready".to_owned()),
            Err(_) => {
                task.abort();
                Err(format!("worker not ready after {wait:?}"))
            }
        }
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HierarchyError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| HierarchyError::WorkerGone(self.game_name.clone()))?;
        answer
            .await
            .map_err(|_| HierarchyError::WorkerGone(self.game_name.clone()))
    }

    /// Runs an agent program.
    pub(crate) async fn execute(&self, program: &str) -> Result<ExecutionOutcome, HierarchyError> {
        let program = program.to_owned();
        Ok(self
            .call(|reply| Command::Execute { program, reply })
            .await??)
    }

    /// Replaces the agent to game name directory.
    pub(crate) async fn update_agent_info(
        &self,
        agents: BTreeMap<String, String>,
    ) -> Result<(), HierarchyError> {
        self.call(|reply| Command::UpdateAgentInfo { agents, reply })
            .await
    }

    /// Disconnects the agent and ends the task.
    pub(crate) async fn close(self) -> Result<(), HierarchyError> {
        let result = self.call(|reply| Command::Close { reply }).await;
        if let Err(error) = self.task.await {
            warn!(game_name = %self.game_name, %error, "agent worker ended abnormally");
        }
        Ok(result??)
    }
}

struct WorkerState {
    spec: WorkerSpec,
    game_to_agent: BTreeMap<String, String>,
    sampling: bool,
    pending: Vec<Event>,
    last_vitals: Option<AgentVitals>,
}

async fn run(
    spec: WorkerSpec,
    mut inbox: mpsc::Receiver<Command>,
    ready: oneshot::Sender<Result<(), WorldError>>,
) {
    if let Err(error) = spec.world.connect_player(&spec.game_name).await {
        let _ = ready.send(Err(error));
        return;
    }
    let mut signals = spec.broker.subscribe();
    let mut listening = true;
    if ready.send(Ok(())).is_err() {
        let _ = spec.world.disconnect_player(&spec.game_name).await;
        return;
    }

    let mut batches = time::interval(BATCH_PERIOD);
    batches.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut worker = WorkerState {
        sampling: spec.sampling,
        spec,
        game_to_agent: BTreeMap::new(),
        pending: Vec::new(),
        last_vitals: None,
    };
    loop {
        tokio::select! {
            command = inbox.recv() => match command {
                Some(Command::Close { reply }) => {
                    let _ = reply.send(worker.disconnect().await);
                    break;
                }
                Some(command) => worker.handle(command).await,
                None => {
                    let _ = worker.disconnect().await;
                    break;
                }
            },
            signal = signals.recv(), if listening => match signal {
                Ok(SamplingSignal::Start) => {
                    worker.sampling = true;
                    worker.last_vitals = None;
                }
                Ok(SamplingSignal::Stop) => {
                    worker.sampling = false;
                    worker.pending.clear();
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(agent = %worker.spec.agent_name, missed, "sampling signals lagged");
                }
                Err(RecvError::Closed) => listening = false,
            },
            _ = batches.tick(), if worker.sampling => worker.report().await,
        }
    }
    debug!(agent = %worker.spec.agent_name, "agent worker stopped");
}

impl WorkerState {
    async fn handle(&mut self, command: Command) {
        match command {
            Command::Execute { program, reply } => {
                let outcome = self
                    .spec
                    .world
                    .execute(&self.spec.game_name, &program)
                    .await;
                if let Ok(outcome) = &outcome {
                    if self.sampling {
                        self.pending.extend(
                            outcome
                                .events
                                .iter()
                                .cloned()
                                .map(|event| to_agent_names(event, &self.game_to_agent)),
                        );
                    }
                }
                let _ = reply.send(outcome);
            }
            Command::UpdateAgentInfo { agents, reply } => {
                self.game_to_agent = agents
                    .into_iter()
                    .map(|(agent, game_name)| (game_name, agent))
                    .collect();
                let _ = reply.send(());
            }
            Command::Close { reply } => {
                let _ = reply.send(self.disconnect().await);
            }
        }
    }

    /// Sends the events collected since the last batch, with the agent's own
    /// status when it changed.
    async fn report(&mut self) {
        let vitals = self
            .spec
            .world
            .sample_player(&self.spec.game_name)
            .await
            .map(|sample| AgentVitals::from_sample(&sample));
        let changed = vitals.is_some() && vitals != self.last_vitals;
        if self.pending.is_empty() && !changed {
            return;
        }
        let batch = EventBatch {
            agent_name: self.spec.agent_name.clone(),
            events: std::mem::take(&mut self.pending),
            vitals: if changed { vitals.clone() } else { None },
        };
        match self.spec.broker.batch_sender().try_send(batch) {
            Ok(()) => {
                if changed {
                    self.last_vitals = vitals;
                }
            }
            Err(mpsc::error::TrySendError::Full(batch)) => {
                warn!(agent = %self.spec.agent_name, "batch queue full, retrying next period");
                self.pending = batch.events;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(agent = %self.spec.agent_name, "observation manager gone");
                self.sampling = false;
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), WorldError> {
        self.sampling = false;
        self.spec.world.disconnect_player(&self.spec.game_name).await
    }
}

/// Replaces game names in an event by agent names.
fn to_agent_names(mut event: Event, game_to_agent: &BTreeMap<String, String>) -> Event {
    let rename = |name: &mut String| {
        if let Some(agent) = game_to_agent.get(name.as_str()) {
            name.clone_from(agent);
        }
    };
    if let Some(name) = event.agent_name.as_mut() {
        rename(name);
    }
    match &mut event.kind {
        EventKind::Chat { visible } => rename(&mut visible.agent_name),
        EventKind::GiveItemToOther { visible } | EventKind::ReceiveItemFromOther { visible } => {
            rename(&mut visible.other_agent_name);
        }
        _ => {}
    }
    event
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc, time::Duration};

    use belief_nest_core::{ChatLine, Event, EventKind};
    use belief_nest_world::{GameWorld, VoxelWorld};

    use super::{to_agent_names, AgentWorker, WorkerSpec};
    use crate::HierarchyError;

    fn spec(world: &Arc<VoxelWorld>, broker: belief_nest_system_observation::AgentBroker) -> WorkerSpec {
        WorkerSpec {
            agent_name: "alice".to_owned(),
            game_name: "p_alice".to_owned(),
            world: Arc::clone(world) as Arc<dyn GameWorld>,
            broker,
            sampling: false,
            ready_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn events_are_renamed_to_agent_names() {
        let names: BTreeMap<_, _> = [("p_alice".to_owned(), "alice".to_owned())].into();
        let event = Event::by_agent(
            "p_alice",
            EventKind::Chat {
                visible: ChatLine {
                    agent_name: "p_alice".to_owned(),
                    msg: "hi".to_owned(),
                },
            },
        );
        let renamed = to_agent_names(event, &names);
        assert_eq!(renamed.agent_name.as_deref(), Some("alice"));
        assert!(matches!(
            renamed.kind,
            EventKind::Chat { visible } if visible.agent_name == "alice"
        ));
    }

    #[tokio::test]
    async fn workers_connect_run_programs_and_disconnect() {
        let world = Arc::new(VoxelWorld::new());
        let manager_world: Arc<dyn GameWorld> = Arc::clone(&world) as Arc<dyn GameWorld>;
        let manager = belief_nest_system_observation::ObservationManager::new(
            manager_world,
            crate::WorldConfig::default().manager_settings(belief_nest_core::BlockPos::new(0, 0, 0)),
            std::env::temp_dir(),
            None,
        );
        let worker = AgentWorker::start(&spec(&world, manager.broker().clone()), 1)
            .await
            .expect("worker started");
        assert!(world.player_names().await.contains(&"p_alice".to_owned()));

        let outcome = worker.execute("chat hello").await.expect("executed");
        assert!(outcome.success);
        worker.close().await.expect("closed");
        assert!(!world.player_names().await.contains(&"p_alice".to_owned()));
    }

    #[tokio::test]
    async fn failing_workers_give_up_after_the_retry_limit() {
        let world = Arc::new(VoxelWorld::new());
        world.connect_player("p_alice").await.expect("taken");
        let manager = belief_nest_system_observation::ObservationManager::new(
            Arc::clone(&world) as Arc<dyn GameWorld>,
            crate::WorldConfig::default().manager_settings(belief_nest_core::BlockPos::new(0, 0, 0)),
            std::env::temp_dir(),
            None,
        );
        let result = AgentWorker::start(&spec(&world, manager.broker().clone()), 3).await;
        assert!(matches!(
            result,
            Err(HierarchyError::WorkerCreation { attempts: 3, .. })
        ));
    }
}
