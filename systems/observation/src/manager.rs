//! Lifecycle of an observation manager.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use belief_nest_core::{
    Block, BlockPatch, BlockPos, BlockUpdate, ContainerPatch, Event, ItemCounts, Tick,
    EQUIPMENT_SLOTS, INITIAL_TICK,
};
use belief_nest_system_record::{Memory, ObservationRecord};
use belief_nest_system_visibility::{VisibilityEngine, VisibilitySettings};
use belief_nest_world::{
    place_and_confirm, teleport_and_wait, GameWorld, WaitPolicy, POLL_INTERVAL,
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    broker::{AgentBroker, EventBatch, SamplingSignal},
    checkpoint::{self, FileKind},
    follow,
    replication::{ChildLink, ChildRequest, DownstreamPort, ReplicatedTick, UpstreamPort},
    stall::StallDetector,
    AgentVitals, ManagerSettings, Mode, ObservationError,
};

const STALL_SEED: u64 = 0x5eed;
const MATERIALIZE_TIMEOUT: Duration = Duration::from_secs(5);

/// Options of [`ObservationManager::stop`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Fail when already stopped.
    pub strict: bool,
    /// Do not wait for in-flight work.
    pub force: bool,
}

/// Options of [`ObservationManager::dump`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DumpOptions {
    /// Tick a following world must have stopped at.
    pub end_tick: Option<Tick>,
    /// Stay stopped after dumping.
    pub stop: bool,
    /// Replace existing checkpoints.
    pub overwrite: bool,
}

/// Result of [`ObservationManager::overwrite_state`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OverwriteOutcome {
    /// Whether every step succeeded.
    pub success: bool,
    /// Failure of the first step that failed.
    pub error_msg: Option<String>,
}

/// Snapshot of the scheduler state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManagerStatus {
    /// Selected mode.
    pub mode: Option<Mode>,
    /// Whether the scheduler runs.
    pub active: bool,
    /// Live tick.
    pub tick: Tick,
}

#[derive(Debug)]
pub(crate) struct ManagerState {
    pub(crate) mode: Option<Mode>,
    pub(crate) active: bool,
    pub(crate) tick: Tick,
    pub(crate) stop_follow_tick: Option<Tick>,
    pub(crate) previous_player_obs: Option<Tick>,
    pub(crate) previous_block_obs: Option<Tick>,
    /// Game name per agent.
    pub(crate) agents: BTreeMap<String, String>,
    pub(crate) non_existent: BTreeSet<String>,
    /// Data-integrity failure that halted the scheduler, kept for `dump`.
    pub(crate) fault: Option<ObservationError>,
}

impl ManagerState {
    pub(crate) fn roster(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }
}

#[derive(Debug)]
pub(crate) struct Records {
    pub(crate) objective: ObservationRecord,
    pub(crate) subjective: BTreeMap<String, ObservationRecord>,
}

/// Inputs collected between two observations.
#[derive(Debug, Default)]
pub(crate) struct PendingInputs {
    pub(crate) block_events: Vec<Event>,
    pub(crate) player_events: Vec<Event>,
    pub(crate) vitals: BTreeMap<String, AgentVitals>,
    pub(crate) block_changes: Option<broadcast::Receiver<BlockUpdate>>,
}

#[derive(Debug)]
struct Scheduler {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Scheduler {
    fn halt(self) {
        let _ = self.stop.send(true);
        drop(self.task);
    }
}

pub(crate) struct Inner {
    pub(crate) world: Arc<dyn GameWorld>,
    pub(crate) settings: ManagerSettings,
    pub(crate) engine: VisibilityEngine,
    pub(crate) branch_dir: Mutex<PathBuf>,
    pub(crate) state: Mutex<ManagerState>,
    pub(crate) records: Mutex<Records>,
    pub(crate) observing: AtomicBool,
    pub(crate) following: AtomicBool,
    pub(crate) flushing: AtomicBool,
    pub(crate) overwrite_queue: Mutex<Vec<BlockUpdate>>,
    pub(crate) follow_queue: Mutex<VecDeque<ReplicatedTick>>,
    pub(crate) pending: Mutex<PendingInputs>,
    pub(crate) batches: Mutex<mpsc::Receiver<EventBatch>>,
    pub(crate) stall: Mutex<StallDetector>,
    pub(crate) rng: Mutex<ChaCha8Rng>,
    pub(crate) upstream: Option<mpsc::UnboundedSender<ChildRequest>>,
    pub(crate) cancel_acked: AtomicBool,
    pub(crate) children: Mutex<BTreeMap<String, ChildLink>>,
    broker: AgentBroker,
    scheduler: Mutex<Option<Scheduler>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.background.get_mut().drain(..) {
            task.abort();
        }
        if let Some(scheduler) = self.scheduler.get_mut().take() {
            scheduler.halt();
        }
    }
}

/// Marks a cycle as in flight until dropped.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Records what happens in one belief world and replicates it to child
/// worlds.
///
/// The manager is a cheap handle; clones share the same state. It either
/// samples the external world itself (observe mode) or replays the history
/// its parent world sends (follow mode), one tick per scheduler period.
#[derive(Clone)]
pub struct ObservationManager {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for ObservationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationManager")
            .field("status", &self.status())
            .field("branch_dir", &*self.inner.branch_dir.lock())
            .finish()
    }
}

impl ObservationManager {
    /// Creates a manager for a belief world whose checkpoints live in
    /// `branch_dir`. `upstream` connects a child world to its parent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        world: Arc<dyn GameWorld>,
        settings: ManagerSettings,
        branch_dir: impl Into<PathBuf>,
        upstream: Option<UpstreamPort>,
    ) -> Self {
        let engine = VisibilityEngine::new(
            VisibilitySettings {
                env_box: settings.env_box,
                offset: settings.offset,
                max_distance: settings.config.max_visible_distance,
                eye_height: settings.eye_height,
                extra_transparent: settings.config.extra_transparent_blocks.clone(),
            },
            world.catalog().clone(),
        );
        let policy = settings.config.position_memory;
        let (broker, batches) = AgentBroker::new();
        let (upstream_tx, upstream_rx) = match upstream {
            Some(port) => (Some(port.requests), Some(port.replies)),
            None => (None, None),
        };
        let inner = Arc::new(Inner {
            engine,
            branch_dir: Mutex::new(branch_dir.into()),
            state: Mutex::new(ManagerState {
                mode: None,
                active: false,
                tick: INITIAL_TICK,
                stop_follow_tick: None,
                previous_player_obs: None,
                previous_block_obs: None,
                agents: BTreeMap::new(),
                non_existent: BTreeSet::new(),
                fault: None,
            }),
            records: Mutex::new(Records {
                objective: ObservationRecord::new_objective(policy),
                subjective: BTreeMap::new(),
            }),
            observing: AtomicBool::new(false),
            following: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            overwrite_queue: Mutex::new(Vec::new()),
            follow_queue: Mutex::new(VecDeque::new()),
            pending: Mutex::new(PendingInputs::default()),
            batches: Mutex::new(batches),
            stall: Mutex::new(StallDetector::new(&settings.config)),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(STALL_SEED)),
            upstream: upstream_tx,
            cancel_acked: AtomicBool::new(false),
            children: Mutex::new(BTreeMap::new()),
            broker,
            scheduler: Mutex::new(None),
            background: Mutex::new(Vec::new()),
            world,
            settings,
        });

        let mut background = vec![spawn_flusher(&inner)];
        if let Some(replies) = upstream_rx {
            background.push(tokio::spawn(follow::listen_upstream(
                Arc::downgrade(&inner),
                replies,
            )));
        }
        *inner.background.lock() = background;
        Self { inner }
    }

    /// Live tick.
    #[must_use]
    pub fn tick(&self) -> Tick {
        self.inner.state.lock().tick
    }

    /// Mode, activity and tick.
    #[must_use]
    pub fn status(&self) -> ManagerStatus {
        let state = self.inner.state.lock();
        ManagerStatus {
            mode: state.mode,
            active: state.active,
            tick: state.tick,
        }
    }

    /// Broker the agent workers of this world report through.
    #[must_use]
    pub fn broker(&self) -> &AgentBroker {
        &self.inner.broker
    }

    /// Branch directory checkpoints are written to.
    #[must_use]
    pub fn branch_dir(&self) -> PathBuf {
        self.inner.branch_dir.lock().clone()
    }

    /// Replaces the agents of the world, keyed by agent name with their game
    /// names as values.
    pub fn set_agents(&self, agents: BTreeMap<String, String>) {
        self.inner.state.lock().agents = agents;
    }

    /// Copy of the objective memory.
    #[must_use]
    pub fn objective_memory(&self) -> Memory {
        self.inner.records.lock().objective.memory().clone()
    }

    /// Copy of an agent's subjective memory.
    #[must_use]
    pub fn subjective_memory(&self, agent: &str) -> Option<Memory> {
        self.inner
            .records
            .lock()
            .subjective
            .get(agent)
            .map(|record| record.memory().clone())
    }

    /// Number of replicated ticks waiting to be replayed.
    #[must_use]
    pub fn follow_queue_len(&self) -> usize {
        self.inner.follow_queue.lock().len()
    }

    /// Selects the mode the next [`start`](Self::start) runs in.
    pub fn switch_mode(&self, mode: Mode) -> Result<(), ObservationError> {
        let mut state = self.inner.state.lock();
        if state.active {
            return Err(ObservationError::AlreadyStarted(mode_label(state.mode)));
        }
        state.mode = Some(mode);
        Ok(())
    }

    /// Starts the scheduler of the selected mode.
    pub fn start(&self) -> Result<(), ObservationError> {
        let (mode, tick) = {
            let mut state = self.inner.state.lock();
            if state.active {
                return Err(ObservationError::AlreadyStarted(mode_label(state.mode)));
            }
            let mode = state.mode.ok_or(ObservationError::ModeNotSet)?;
            if mode == Mode::Follow && self.inner.upstream.is_none() {
                return Err(ObservationError::NoParent);
            }
            if mode == Mode::Observe {
                state.tick = state.tick.next();
            }
            state.active = true;
            state.fault = None;
            (mode, state.tick)
        };
        match mode {
            Mode::Observe => {
                self.inner.pending.lock().block_changes =
                    Some(self.inner.world.subscribe_block_changes());
                self.inner.broker.publish(SamplingSignal::Start);
            }
            Mode::Follow => {
                self.inner.follow_queue.lock().clear();
                self.request_upstream(ChildRequest::Fetch { prev_tick: tick })?;
            }
        }
        let period = match mode {
            Mode::Observe => self.inner.settings.config.tick_period(),
            Mode::Follow => self.inner.settings.config.follow_period(),
        };
        *self.inner.scheduler.lock() = Some(spawn_scheduler(&self.inner, mode, period));
        info!(%mode, tick = %tick, "observation started");
        Ok(())
    }

    /// Stops the scheduler. Unless forced, waits for the sample in flight
    /// (observe) or for the replay queue to drain (follow).
    pub async fn stop(&self, options: StopOptions) -> Result<(), ObservationError> {
        let mode = {
            let mut state = self.inner.state.lock();
            if !state.active {
                if options.strict {
                    return Err(ObservationError::NotActive);
                }
                return Ok(());
            }
            state.active = false;
            state.mode
        };
        match mode {
            Some(Mode::Observe) => {
                self.halt_scheduler();
                self.inner.pending.lock().block_changes = None;
                if !options.force {
                    self.wait_until("the observation in flight", |inner| {
                        !inner.observing.load(Ordering::Acquire)
                    })
                    .await;
                }
                self.inner.broker.publish(SamplingSignal::Stop);
            }
            Some(Mode::Follow) => {
                if !options.force {
                    self.wait_until("the follow queue to drain", |inner| {
                        inner.follow_queue.lock().is_empty()
                            && !inner.following.load(Ordering::Acquire)
                    })
                    .await;
                }
                self.halt_scheduler();
            }
            None => self.halt_scheduler(),
        }
        info!(tick = %self.tick(), "observation stopped");
        Ok(())
    }

    /// Writes the objective and every subjective record to the branch
    /// directory and returns the tick written, or the initial tick when
    /// nothing was recorded yet.
    pub async fn dump(&self, options: DumpOptions) -> Result<Tick, ObservationError> {
        let mut resume = false;
        let status = self.status();
        match options.end_tick {
            Some(end_tick) => {
                if status.mode == Some(Mode::Observe) {
                    return Err(ObservationError::InvalidMode(
                        "an end tick only applies to follow mode".to_owned(),
                    ));
                }
                let target = self.inner.state.lock().stop_follow_tick;
                if let Some(stop) = target.filter(|stop| *stop < status.tick) {
                    return Err(ObservationError::StopTickPassed {
                        stop,
                        now: status.tick,
                    });
                }
                if status.active {
                    info!(now = %status.tick, target = ?target, "waiting for follow to reach the stop tick");
                    self.wait_until("follow to reach the stop tick", |inner| {
                        !inner.state.lock().active
                    })
                    .await;
                }
                if let Some(fault) = self.inner.state.lock().fault.take() {
                    return Err(fault);
                }
                let actual = self.tick();
                if actual != end_tick {
                    return Err(ObservationError::TickMismatch {
                        expected: end_tick,
                        actual,
                    });
                }
                resume = !options.stop;
            }
            None => {
                if status.active {
                    self.stop(StopOptions::default()).await?;
                    resume = !options.stop;
                }
            }
        }

        let now = self.write_checkpoints(options.overwrite)?;
        if resume {
            self.start()?;
        }
        debug!(tick = %now, "dump finished");
        Ok(now)
    }

    fn write_checkpoints(&self, overwrite: bool) -> Result<Tick, ObservationError> {
        let dir = self.branch_dir();
        let records = {
            let records = self.inner.records.lock();
            Records {
                objective: records.objective.clone(),
                subjective: records.subjective.clone(),
            }
        };
        let Some(now) = records.objective.last_tick() else {
            return Ok(INITIAL_TICK);
        };
        let internal = checkpoint::internal_dir(&dir);
        std::fs::create_dir_all(&internal)
            .map_err(|error| ObservationError::io(&internal, error))?;
        let _ = checkpoint::dump_record(&records.objective, &dir, "", now, overwrite)?;
        for (agent, record) in &records.subjective {
            let _ = checkpoint::dump_record(
                record,
                &internal,
                &checkpoint::agent_prefix(agent),
                now,
                overwrite,
            )?;
        }
        info!(tick = %now, dir = %dir.display(), "checkpoint dumped");
        Ok(now)
    }

    /// Rebuilds every record from the newest checkpoint of the branch
    /// directory.
    ///
    /// Without a recorded tick the subjective records start from the static
    /// blocks of the objective state. `do_initialize` also rebuilds the
    /// live world from the loaded state.
    pub async fn load(&self, do_initialize: bool) -> Result<(), ObservationError> {
        let agents = {
            let state = self.inner.state.lock();
            if state.active {
                return Err(ObservationError::AlreadyStarted(mode_label(state.mode)));
            }
            state.roster()
        };
        for link in self.inner.children.lock().values_mut() {
            link.forget_request();
        }
        self.inner.follow_queue.lock().clear();

        let dir = self.branch_dir();
        let newest = checkpoint::newest(&dir, "", FileKind::State)?
            .ok_or_else(|| ObservationError::MissingSnapshot(dir.clone()))?;
        let policy = self.inner.settings.config.position_memory;
        let internal = checkpoint::internal_dir(&dir);
        let mut objective = ObservationRecord::new_objective(policy);
        let mut subjective = BTreeMap::new();

        if newest.tick.is_initial() {
            let state = checkpoint::read_state(&dir, "", newest.tick)?;
            objective.import(&state, None)?;
            std::fs::create_dir_all(&internal)
                .map_err(|error| ObservationError::io(&internal, error))?;
            let seed = objective.block_memory(Some(self.inner.settings.static_block_types.as_slice()));
            for agent in agents {
                let mut record = ObservationRecord::new_subjective(agent.clone(), policy);
                record.set_block_memory(seed.clone());
                checkpoint::dump_initial_state(
                    &record,
                    &internal,
                    &checkpoint::agent_prefix(&agent),
                )?;
                let _ = subjective.insert(agent, record);
            }
        } else {
            let _ = checkpoint::load_record(&mut objective, &dir, "")?;
            for agent in agents {
                let mut record = ObservationRecord::new_subjective(agent.clone(), policy);
                let _ = checkpoint::load_record(
                    &mut record,
                    &internal,
                    &checkpoint::agent_prefix(&agent),
                )?;
                let _ = subjective.insert(agent, record);
            }
        }

        {
            let mut state = self.inner.state.lock();
            state.tick = newest.tick;
            state.previous_player_obs = None;
            state.previous_block_obs = None;
        }
        *self.inner.records.lock() = Records {
            objective,
            subjective,
        };
        info!(tick = %newest.tick, dir = %dir.display(), "observation loaded");

        if do_initialize {
            self.materialize().await?;
        }
        Ok(())
    }

    /// Rebuilds the live world from the objective memory.
    async fn materialize(&self) -> Result<(), ObservationError> {
        let offset = self.inner.settings.offset;
        let (blocks, containers, statuses) = {
            let records = self.inner.records.lock();
            let memory = records.objective.memory();
            let blocks: Vec<BlockUpdate> = memory
                .blocks
                .iter()
                .filter(|(_, block)| block.name != "air")
                .map(|(pos, block)| BlockUpdate::new(pos, block.clone()))
                .collect();
            let containers: Vec<(BlockPos, ItemCounts)> = memory
                .containers
                .iter()
                .map(|(pos, items)| (pos.offset(offset), items.clone()))
                .collect();
            (blocks, containers, memory.status.clone())
        };
        let agents = self.inner.state.lock().agents.clone();
        let world = self.inner.world.as_ref();

        world
            .clear_box(self.inner.settings.env_box.shifted(offset))
            .await?;
        place_and_confirm(
            world,
            &to_absolute(&blocks, offset),
            WaitPolicy::strict(MATERIALIZE_TIMEOUT),
        )
        .await?;
        for (pos, items) in &containers {
            world.set_container(*pos, items).await?;
        }

        let mut non_existent = BTreeSet::new();
        for (agent, game_name) in &agents {
            let status = statuses.get(agent);
            match status.and_then(|status| status.visible.position) {
                Some(position) => {
                    let target = position.shifted(offset);
                    let policy = WaitPolicy::strict(MATERIALIZE_TIMEOUT);
                    if let Err(error) = teleport_and_wait(world, game_name, target, policy).await {
                        error!(agent = %agent, %error, "failed to teleport agent");
                    }
                    world.set_transparency(game_name, false).await?;
                }
                None => {
                    world.set_transparency(game_name, true).await?;
                    let _ = non_existent.insert(agent.clone());
                }
            }
            let inventory = status
                .and_then(|status| status.hidden.as_ref())
                .and_then(|hidden| hidden.inventory.clone())
                .unwrap_or_default();
            let equipment = status
                .and_then(|status| status.visible.equipment.clone())
                .unwrap_or_else(|| vec![None; EQUIPMENT_SLOTS]);
            world
                .set_inventory_and_equipment(game_name, &inventory, &equipment)
                .await?;
        }
        self.inner.state.lock().non_existent = non_existent;
        debug!(
            blocks = blocks.len(),
            containers = containers.len(),
            agents = agents.len(),
            "world rebuilt from memory"
        );
        Ok(())
    }

    /// Makes a following world stop once it reaches `tick`.
    pub fn set_stop_follow_tick(&self, tick: Tick) {
        self.inner.state.lock().stop_follow_tick = Some(tick);
    }

    /// Points the manager at another branch directory and loads it.
    pub async fn update_branch_dir(&self, dir: impl Into<PathBuf>) -> Result<(), ObservationError> {
        *self.inner.branch_dir.lock() = dir.into();
        self.load(true).await
    }

    /// Applies a state patch to objective memory and the live world, queues it
    /// for the next recorded tick and dumps with overwrite.
    ///
    /// Memory is patched first and stays patched when a later step fails; the
    /// failure is reported in the outcome.
    pub async fn overwrite_state(
        &self,
        blocks: &[BlockPatch],
        containers: &[ContainerPatch],
    ) -> OverwriteOutcome {
        self.inner
            .records
            .lock()
            .objective
            .overwrite_state(blocks, containers);
        match self.apply_overwrite(blocks, containers).await {
            Ok(()) => OverwriteOutcome {
                success: true,
                error_msg: None,
            },
            Err(error) => {
                error!(%error, "state overwrite failed");
                OverwriteOutcome {
                    success: false,
                    error_msg: Some(error.to_string()),
                }
            }
        }
    }

    async fn apply_overwrite(
        &self,
        blocks: &[BlockPatch],
        containers: &[ContainerPatch],
    ) -> Result<(), ObservationError> {
        let offset = self.inner.settings.offset;
        if !blocks.is_empty() {
            let updates: Vec<BlockUpdate> = blocks
                .iter()
                .map(|patch| {
                    BlockUpdate::new(
                        BlockPos::from(patch.position),
                        Block {
                            name: patch.name.clone().unwrap_or_else(|| "air".to_owned()),
                            state_id: None,
                            properties: patch.properties.clone(),
                        },
                    )
                })
                .collect();
            self.inner
                .world
                .set_blocks(&to_absolute(&updates, offset))
                .await?;
            self.inner.overwrite_queue.lock().extend(updates);
        }
        for patch in containers {
            let items = patch.items.clone().unwrap_or_default();
            self.inner
                .world
                .set_container(BlockPos::from(patch.position).offset(offset), &items)
                .await?;
        }
        let _ = self
            .dump(DumpOptions {
                overwrite: true,
                ..DumpOptions::default()
            })
            .await?;
        Ok(())
    }

    /// Connects a child world created under `agent` and returns its end of
    /// the replication channel.
    pub fn attach_child(&self, agent: &str) -> UpstreamPort {
        let (upstream, downstream) = crate::replication_channel();
        self.attach_child_port(agent, downstream);
        upstream
    }

    /// Connects a child world through an existing channel end.
    pub fn attach_child_port(&self, agent: &str, port: DownstreamPort) {
        let _ = self
            .inner
            .children
            .lock()
            .insert(agent.to_owned(), ChildLink::new(port));
        debug!(agent, "child world attached");
    }

    /// Disconnects the child world of `agent`.
    pub fn detach_child(&self, agent: &str) -> Result<(), ObservationError> {
        self.inner
            .children
            .lock()
            .remove(agent)
            .map(|_| ())
            .ok_or_else(|| ObservationError::UnknownChild(agent.to_owned()))
    }

    /// Stops without waiting and ends the background tasks.
    pub async fn close(&self) -> Result<(), ObservationError> {
        self.stop(StopOptions {
            strict: false,
            force: true,
        })
        .await?;
        for task in self.inner.background.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    pub(crate) fn request_upstream(&self, request: ChildRequest) -> Result<(), ObservationError> {
        let sender = self
            .inner
            .upstream
            .as_ref()
            .ok_or(ObservationError::NoParent)?;
        sender
            .send(request)
            .map_err(|_| ObservationError::ChannelClosed("parent"))
    }

    /// Stops scheduling after a data-integrity failure and keeps the failure
    /// for the next dump.
    fn halt_on_fault(&self, mode: Mode, error: ObservationError) {
        {
            let mut state = self.inner.state.lock();
            state.active = false;
            state.stop_follow_tick = None;
            state.fault = Some(error);
        }
        drop(self.inner.scheduler.lock().take());
        match mode {
            Mode::Observe => {
                self.inner.pending.lock().block_changes = None;
                self.inner.broker.publish(SamplingSignal::Stop);
            }
            Mode::Follow => {
                if let Err(error) = self.request_upstream(ChildRequest::Cancel) {
                    warn!(%error, "failed to cancel the outstanding fetch");
                }
            }
        }
    }

    fn halt_scheduler(&self) {
        if let Some(scheduler) = self.inner.scheduler.lock().take() {
            scheduler.halt();
        }
    }

    /// Polls until `done` holds, logging progress at the configured period.
    pub(crate) async fn wait_until<F>(&self, what: &str, done: F)
    where
        F: Fn(&Inner) -> bool + Send,
    {
        let period = self.inner.settings.config.progress_period();
        let mut logged = Instant::now();
        while !done(&self.inner) {
            if logged.elapsed() >= period {
                info!("waiting for {what}");
                logged = Instant::now();
            }
            time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn mode_label(mode: Option<Mode>) -> &'static str {
    mode.map_or("no", Mode::label)
}

fn spawn_scheduler(inner: &Arc<Inner>, mode: Mode, period: Duration) -> Scheduler {
    let (stop, mut stopped) = watch::channel(false);
    let weak = Arc::downgrade(inner);
    let task = tokio::spawn(async move {
        let mut ticks = time::interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticks.tick() => {}
                _ = stopped.changed() => break,
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let manager = ObservationManager { inner };
            let outcome = match mode {
                Mode::Observe => manager.observe_once(false).await,
                Mode::Follow => manager.follow_once().await,
            };
            match outcome {
                Ok(()) => {}
                Err(error) if error.is_fatal() => {
                    error!(%mode, %error, "scheduled cycle failed, scheduler halted");
                    manager.halt_on_fault(mode, error);
                    break;
                }
                Err(error) => error!(%mode, %error, "scheduled cycle failed"),
            }
        }
        debug!(%mode, "scheduler finished");
    });
    Scheduler { stop, task }
}

fn spawn_flusher(inner: &Arc<Inner>) -> JoinHandle<()> {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let period = inner.settings.config.flush_period();
    tokio::spawn(async move {
        let mut ticks = time::interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            let _ = ticks.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if let Err(error) = (ObservationManager { inner }).flush_children() {
                warn!(%error, "replication flush failed");
            }
        }
    })
}

/// Shifts relative updates into world-absolute coordinates.
pub(crate) fn to_absolute(updates: &[BlockUpdate], offset: BlockPos) -> Vec<BlockUpdate> {
    updates
        .iter()
        .map(|update| BlockUpdate::new(update.position.offset(offset), update.block.clone()))
        .collect()
}

