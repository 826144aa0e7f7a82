//! One tick of observe mode.

use std::{collections::BTreeMap, mem, time::Instant};

use belief_nest_core::{BlockUpdate, Event, EventClass, EventKind, Point, Tick};
use belief_nest_system_record::{filter_events, filter_status, ObservationRecord};
use belief_nest_world::PlayerSample;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info, trace, warn};

use crate::{
    agent_status,
    manager::{InFlight, Records},
    relativize,
    stall::{nudge_target, NUDGE_CANDIDATES},
    Mode, ObservationError, ObservationManager,
};

fn interval_elapsed(now: Tick, previous: Option<Tick>, interval: u32) -> bool {
    previous.map_or(true, |previous| now.since(previous) >= i64::from(interval))
}

impl ObservationManager {
    /// Runs one observe cycle right away, ignoring the sampling intervals.
    pub async fn observe_now(&self) -> Result<(), ObservationError> {
        if self.status().mode != Some(Mode::Observe) {
            return Err(ObservationError::InvalidMode(
                "observing needs observe mode".to_owned(),
            ));
        }
        self.observe_once(true).await
    }

    pub(crate) async fn observe_once(&self, force: bool) -> Result<(), ObservationError> {
        let (tick, agents) = {
            let mut state = self.inner.state.lock();
            state.tick = state.tick.next();
            (state.tick, state.agents.clone())
        };
        self.nudge_stalled_agents(&agents).await;

        let Some(_observing) = InFlight::acquire(&self.inner.observing) else {
            trace!(tick = %tick, "observation in flight, tick skipped");
            return Ok(());
        };
        self.collect_inputs();

        let config = &self.inner.settings.config;
        let (player_due, block_due) = {
            let state = self.inner.state.lock();
            (
                force
                    || interval_elapsed(tick, state.previous_player_obs, config.player_obs_interval),
                force || interval_elapsed(tick, state.previous_block_obs, config.block_obs_interval),
            )
        };
        if !player_due {
            return Ok(());
        }

        let mut samples: BTreeMap<String, PlayerSample> = BTreeMap::new();
        for (agent, game_name) in &agents {
            if let Some(sample) = self.inner.world.sample_player(game_name).await {
                let _ = samples.insert(agent.clone(), sample);
            }
        }
        if let Some(agent) = samples
            .iter()
            .find_map(|(agent, sample)| (!sample.position.is_finite()).then_some(agent))
        {
            warn!(tick = %tick, agent = %agent, "sampled position is not a number, tick skipped");
            return Ok(());
        }

        self.record_tick(tick, &samples, block_due)?;

        let mut state = self.inner.state.lock();
        state.previous_player_obs = Some(tick);
        if block_due {
            state.previous_block_obs = Some(tick);
        }
        Ok(())
    }

    fn record_tick(
        &self,
        tick: Tick,
        samples: &BTreeMap<String, PlayerSample>,
        block_due: bool,
    ) -> Result<(), ObservationError> {
        let settings = &self.inner.settings;
        let offset = settings.offset;

        let (status, events) = {
            let mut pending = self.inner.pending.lock();
            let status: BTreeMap<_, _> = samples
                .iter()
                .map(|(agent, sample)| {
                    (
                        agent.clone(),
                        agent_status(sample, offset, pending.vitals.get(agent)),
                    )
                })
                .collect();
            let mut events = if block_due {
                mem::take(&mut pending.block_events)
            } else {
                Vec::new()
            };
            events.append(&mut pending.player_events);
            (status, events)
        };

        let mut blocks_to_update: Vec<BlockUpdate> = events
            .iter()
            .filter_map(|event| match (&event.kind, event.block_pos) {
                (EventKind::BlockUpdate { visible }, Some(pos)) => {
                    Some(BlockUpdate::new(pos, visible.clone()))
                }
                _ => None,
            })
            .collect();
        blocks_to_update.append(&mut self.inner.overwrite_queue.lock());

        let (roster, non_existent) = {
            let state = self.inner.state.lock();
            (state.roster(), state.non_existent.clone())
        };
        let positions: BTreeMap<String, Point> = status
            .iter()
            .filter_map(|(agent, status)| Some((agent.clone(), status.visible.position?)))
            .collect();
        let keep_poses = settings.config.disable_position_filtering;
        let policy = settings.config.position_memory;

        let mut records = self.inner.records.lock();
        let Records {
            objective,
            subjective,
        } = &mut *records;
        objective.add_history_objective(
            tick,
            status.clone(),
            events.clone(),
            blocks_to_update,
            None,
            &roster,
        )?;
        let blocks = &objective.memory().blocks;

        let players = self
            .inner
            .engine
            .player_visibility(&positions, blocks, &non_existent);
        let mut grids = if block_due {
            let started = Instant::now();
            let grids = self
                .inner
                .engine
                .block_visibility(&positions, blocks, &non_existent);
            let elapsed = started.elapsed();
            let budget = settings.config.block_visibility_budget();
            if elapsed > budget {
                warn!(tick = %tick, ?elapsed, ?budget, "block visibility exceeded its budget");
            }
            grids
        } else {
            BTreeMap::new()
        };

        for agent in samples.keys() {
            let seen = players.get(agent).cloned().unwrap_or_default();
            let grid = grids.remove(agent);
            let record = subjective.entry(agent.clone()).or_insert_with(|| {
                info!(agent = %agent, "agent observed for the first time");
                ObservationRecord::new_subjective(agent.clone(), policy)
            });
            record.add_history_subjective(
                tick,
                filter_status(&status, agent, &seen, keep_poses),
                filter_events(&events, agent, &seen, grid.as_ref()),
                seen,
                grid,
                blocks,
                &roster,
            )?;
        }
        debug!(tick = %tick, agents = samples.len(), events = events.len(), block_due, "tick observed");
        Ok(())
    }

    /// Moves pending block changes and agent batches into the pending inputs.
    fn collect_inputs(&self) {
        let offset = self.inner.settings.offset;
        let bounds = self.inner.settings.env_box.shifted(offset);
        let active = self.status().active;

        let mut pending = self.inner.pending.lock();
        let mut changes = Vec::new();
        if let Some(receiver) = pending.block_changes.as_mut() {
            loop {
                match receiver.try_recv() {
                    Ok(update) if bounds.contains(update.position) => changes.push(
                        Event::block_update(update.position.minus(offset), update.block),
                    ),
                    Ok(_) => {}
                    Err(TryRecvError::Lagged(missed)) => {
                        warn!(missed, "block change stream lagged");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }
        pending.block_events.append(&mut changes);

        let mut batches = self.inner.batches.lock();
        while let Ok(batch) = batches.try_recv() {
            if !active {
                warn!(agent = %batch.agent_name, "observation inactive, data ignored");
                continue;
            }
            for event in batch.events {
                let event = relativize(event, offset);
                match event.kind.class() {
                    EventClass::Block => pending.block_events.push(event),
                    EventClass::Player => pending.player_events.push(event),
                }
            }
            if let Some(vitals) = batch.vitals {
                let _ = pending.vitals.insert(batch.agent_name, vitals);
            }
        }
    }

    async fn nudge_stalled_agents(&self, agents: &BTreeMap<String, String>) {
        let world = self.inner.world.as_ref();
        for (agent, game_name) in agents {
            if !world.is_moving(game_name).await {
                continue;
            }
            if !self.inner.stall.lock().count_moving_tick(agent) {
                continue;
            }
            let Some(sample) = world.sample_player(game_name).await else {
                continue;
            };
            if !self.inner.stall.lock().record(agent, sample.position) {
                continue;
            }
            let cell = sample.position.floor();
            let mut free = Vec::new();
            for candidate in NUDGE_CANDIDATES {
                let pos = cell.offset(candidate);
                let passable = match world.block_at(pos).await {
                    Some(block) => world.catalog().is_non_colliding(&block.name),
                    None => true,
                };
                if passable {
                    free.push(pos);
                }
            }
            let target = nudge_target(&mut self.inner.rng.lock(), sample.position, &free);
            info!(agent = %agent, ?target, "agent stalled, nudging");
            if let Err(error) = world.move_player(game_name, target).await {
                warn!(agent = %agent, %error, "failed to nudge agent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::interval_elapsed;
    use belief_nest_core::Tick;

    #[test]
    fn intervals_count_from_the_previous_sample() {
        assert!(interval_elapsed(Tick::new(0), None, 5));
        assert!(!interval_elapsed(Tick::new(4), Some(Tick::new(0)), 5));
        assert!(interval_elapsed(Tick::new(5), Some(Tick::new(0)), 5));
    }
}
