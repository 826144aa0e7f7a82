//! One tick of follow mode and the child side of replication.

use std::{
    collections::BTreeMap,
    sync::{atomic::Ordering, Weak},
    time::Duration,
};

use belief_nest_core::{AgentStatus, BlockUpdate};
use belief_nest_system_record::{filter_events, filter_status, ObservationRecord};
use belief_nest_world::{place_and_confirm, teleport_and_wait, WaitPolicy};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    manager::{to_absolute, InFlight, Inner, Records},
    ChildRequest, Mode, ObservationError, ObservationManager, ParentReply, ReplicatedTick,
    StopOptions,
};

const FOLLOW_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives the parent's answers for as long as the manager lives.
pub(crate) async fn listen_upstream(
    inner: Weak<Inner>,
    mut replies: mpsc::UnboundedReceiver<ParentReply>,
) {
    while let Some(reply) = replies.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = ObservationManager { inner };
        match reply {
            ParentReply::Fetch(ticks) => manager.receive_ticks(ticks),
            ParentReply::CancelAck => manager.inner.cancel_acked.store(true, Ordering::Release),
        }
    }
    debug!("parent connection closed");
}

impl ObservationManager {
    fn receive_ticks(&self, ticks: Vec<ReplicatedTick>) {
        let last = ticks.last().map(|tick| tick.tick);
        debug!(count = ticks.len(), last = ?last, "ticks received from parent");
        self.inner.follow_queue.lock().extend(ticks);
        let (following, now) = {
            let state = self.inner.state.lock();
            (
                state.active && state.mode == Some(Mode::Follow),
                state.tick,
            )
        };
        if following {
            let prev_tick = last.unwrap_or(now);
            if let Err(error) = self.request_upstream(ChildRequest::Fetch { prev_tick }) {
                warn!(%error, "failed to request more ticks");
            }
        }
    }

    /// Whether follow stands at its stop tick.
    fn stop_tick_reached(&self) -> Result<bool, ObservationError> {
        let state = self.inner.state.lock();
        match state.stop_follow_tick {
            Some(stop) if stop < state.tick => Err(ObservationError::StopTickPassed {
                stop,
                now: state.tick,
            }),
            Some(stop) => Ok(stop == state.tick),
            None => Ok(false),
        }
    }

    pub(crate) async fn follow_once(&self) -> Result<(), ObservationError> {
        let Some(_following) = InFlight::acquire(&self.inner.following) else {
            return Ok(());
        };
        if self.stop_tick_reached()? {
            self.halt_at_stop_tick(true).await?;
            return Ok(());
        }
        let count = self.follow_queue_len();
        for index in 0..count {
            if self.stop_tick_reached()? {
                self.halt_at_stop_tick(false).await?;
                return Ok(());
            }
            let Some(item) = self.inner.follow_queue.lock().pop_front() else {
                break;
            };
            let now = self.tick();
            if item.tick <= now {
                error!(tick = %item.tick, now = %now, "fetched a past tick, skipped");
                continue;
            }
            self.apply_tick(&item, index + 1 == count).await?;
        }
        Ok(())
    }

    async fn halt_at_stop_tick(&self, clear_queue: bool) -> Result<(), ObservationError> {
        info!(tick = %self.tick(), "follow reached its stop tick");
        self.stop(StopOptions {
            strict: false,
            force: true,
        })
        .await?;
        self.cancel_upstream().await?;
        if clear_queue {
            self.inner.follow_queue.lock().clear();
        }
        self.inner.state.lock().stop_follow_tick = None;
        Ok(())
    }

    /// Cancels the outstanding fetch and waits for the parent to confirm.
    async fn cancel_upstream(&self) -> Result<(), ObservationError> {
        self.inner.cancel_acked.store(false, Ordering::Release);
        self.request_upstream(ChildRequest::Cancel)?;
        self.wait_until("the parent to acknowledge the cancel", |inner| {
            inner.cancel_acked.load(Ordering::Acquire)
                || inner.upstream.as_ref().map_or(true, |sender| sender.is_closed())
        })
        .await;
        if self.inner.cancel_acked.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ObservationError::ChannelClosed("parent"))
        }
    }

    async fn apply_tick(&self, item: &ReplicatedTick, is_last: bool) -> Result<(), ObservationError> {
        let (entry, others) = item.decode()?;
        let tick = item.tick;
        let settings = &self.inner.settings;
        let keep_poses = settings.config.disable_position_filtering;
        let policy = settings.config.position_memory;

        let mut updates: Vec<BlockUpdate> = entry.updated_blocks.clone();
        updates.append(&mut self.inner.overwrite_queue.lock());
        let roster = self.inner.state.lock().roster();

        self.inner.records.lock().objective.add_history_objective(
            tick,
            entry.status.clone(),
            entry.events.clone(),
            updates.clone(),
            entry.visibility.clone(),
            &roster,
        )?;

        let world = self.inner.world.as_ref();
        let absolute = to_absolute(&updates, settings.offset);
        if let Err(error) =
            place_and_confirm(world, &absolute, WaitPolicy::tolerant(FOLLOW_TIMEOUT)).await
        {
            error!(tick = %tick, %error, "failed to replay block updates");
        }
        if is_last {
            self.apply_poses(&entry.status).await;
        }

        {
            let mut records = self.inner.records.lock();
            let Records {
                objective,
                subjective,
            } = &mut *records;
            let blocks = &objective.memory().blocks;
            for agent in &roster {
                let Some(visibility) = others.get(agent).or(entry.visibility.as_ref()) else {
                    warn!(tick = %tick, agent = %agent, "no visibility for agent, tick missing from its record");
                    continue;
                };
                let players = visibility.players.clone();
                let grid = visibility.blocks.clone();
                let status = filter_status(&entry.status, agent, &players, keep_poses);
                let events = filter_events(&entry.events, agent, &players, grid.as_ref());
                let record = subjective
                    .entry(agent.clone())
                    .or_insert_with(|| ObservationRecord::new_subjective(agent.clone(), policy));
                record.add_history_subjective(
                    tick, status, events, players, grid, blocks, &roster,
                )?;
            }
        }
        self.inner.state.lock().tick = tick;
        debug!(tick = %tick, updates = updates.len(), "tick followed");
        Ok(())
    }

    /// Moves, hides or reveals agents and restores their equipment.
    async fn apply_poses(&self, status: &BTreeMap<String, AgentStatus>) {
        let offset = self.inner.settings.offset;
        let (agents, mut non_existent) = {
            let state = self.inner.state.lock();
            (state.agents.clone(), state.non_existent.clone())
        };
        let world = self.inner.world.as_ref();
        for (agent, game_name) in &agents {
            let agent_status = status.get(agent);
            match agent_status.and_then(|status| status.visible.position) {
                Some(position) => {
                    if non_existent.remove(agent) {
                        if let Err(error) = world.set_transparency(game_name, false).await {
                            error!(agent = %agent, %error, "failed to reveal agent");
                        }
                    }
                    let target = position.shifted(offset);
                    let policy = WaitPolicy::tolerant(FOLLOW_TIMEOUT);
                    if let Err(error) = teleport_and_wait(world, game_name, target, policy).await {
                        error!(agent = %agent, %error, "failed to teleport agent");
                    }
                }
                None => {
                    if non_existent.insert(agent.clone()) {
                        if let Err(error) = world.set_transparency(game_name, true).await {
                            error!(agent = %agent, %error, "failed to hide agent");
                        }
                    }
                }
            }
            if let Some(equipment) = agent_status.and_then(|status| status.visible.equipment.as_ref()) {
                if let Err(error) = world.set_equipment(game_name, equipment).await {
                    error!(agent = %agent, %error, "failed to restore equipment");
                }
            }
        }
        self.inner.state.lock().non_existent = non_existent;
    }
}
