//! Conversion of raw player samples and agent events into recorded form.

use belief_nest_core::{
    round_to, AgentStatus, BlockPos, Event, EventKind, HiddenStatus, ItemCounts, VisibleStatus,
};
use belief_nest_world::PlayerSample;
use serde::{Deserialize, Serialize};

const POSITION_DECIMALS: i32 = 3;
const ANGLE_DECIMALS: i32 = 2;

/// Status fields an agent reports about itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentVitals {
    /// Item type per equipment slot.
    pub equipment: Vec<Option<String>>,
    /// Inventory contents.
    pub inventory: ItemCounts,
    /// Health points.
    pub health: f64,
    /// Food level.
    pub food: f64,
    /// Food saturation.
    pub saturation: f64,
    /// Remaining breath.
    pub oxygen: f64,
}

impl AgentVitals {
    /// Vitals carried by a raw sample.
    #[must_use]
    pub fn from_sample(sample: &PlayerSample) -> Self {
        Self {
            equipment: sample.equipment.clone(),
            inventory: sample.inventory.clone(),
            health: sample.health,
            food: sample.food,
            saturation: sample.saturation,
            oxygen: sample.oxygen,
        }
    }
}

/// Bucket name of a game time of day given in ticks.
#[must_use]
pub fn time_of_day_label(ticks: u32) -> &'static str {
    match ticks % 24_000 {
        0..=999 => "sunrise",
        1_000..=5_999 => "day",
        6_000..=11_999 => "noon",
        12_000..=12_999 => "sunset",
        13_000..=17_999 => "night",
        18_000..=21_999 => "midnight",
        _ => "sunrise",
    }
}

/// Recorded status of an agent, relative to the belief world's offset.
///
/// Vitals reported by the agent take precedence over the ones sampled by the
/// observer.
#[must_use]
pub fn agent_status(
    sample: &PlayerSample,
    offset: BlockPos,
    reported: Option<&AgentVitals>,
) -> AgentStatus {
    let sampled;
    let vitals = match reported {
        Some(vitals) => vitals,
        None => {
            sampled = AgentVitals::from_sample(sample);
            &sampled
        }
    };
    AgentStatus {
        visible: VisibleStatus {
            position: Some(sample.position.unshifted(offset).rounded(POSITION_DECIMALS)),
            velocity: Some(sample.velocity.rounded(POSITION_DECIMALS)),
            yaw: Some(round_to(sample.yaw, ANGLE_DECIMALS)),
            pitch: Some(round_to(sample.pitch, ANGLE_DECIMALS)),
            on_ground: Some(sample.on_ground),
            equipment: Some(vitals.equipment.clone()),
            is_in_water: Some(sample.is_in_water),
            is_in_lava: Some(sample.is_in_lava),
            is_in_web: Some(sample.is_in_web),
        },
        hidden: Some(HiddenStatus {
            inventory: Some(vitals.inventory.clone()),
            health: Some(vitals.health),
            food: Some(vitals.food),
            saturation: Some(vitals.saturation),
            oxygen: Some(vitals.oxygen),
            is_collided_horizontally: Some(sample.is_collided_horizontally),
            is_collided_vertically: Some(sample.is_collided_vertically),
            biome: Some(sample.biome.clone()),
            time_of_day: Some(time_of_day_label(sample.time_of_day).to_owned()),
        }),
    }
}

/// Moves every coordinate of a world-absolute event into the belief world's
/// frame.
#[must_use]
pub fn relativize(mut event: Event, offset: BlockPos) -> Event {
    let local = |pos: BlockPos| pos.minus(offset);
    event.block_pos = event.block_pos.map(local);
    match &mut event.kind {
        EventKind::MineBlock { visible } => visible.pos = local(visible.pos),
        EventKind::GetItemFromChest { visible, .. } => {
            visible.chest_pos = visible.chest_pos.map(local);
        }
        EventKind::DepositItemIntoChest { visible, .. } => {
            visible.chest_pos = visible.chest_pos.map(local);
        }
        EventKind::MoveTo { visible } => {
            visible.start_pos = visible.start_pos.unshifted(offset);
            visible.goal_pos = visible.goal_pos.unshifted(offset);
        }
        EventKind::UseLever { visible } => visible.lever_pos = local(visible.lever_pos),
        EventKind::BlockUpdate { .. }
        | EventKind::Chat { .. }
        | EventKind::CraftItem { .. }
        | EventKind::SmeltItem { .. }
        | EventKind::GiveItemToOther { .. }
        | EventKind::ReceiveItemFromOther { .. }
        | EventKind::Think { .. } => {}
    }
    event
}

#[cfg(test)]
mod tests {
    use super::{agent_status, relativize, time_of_day_label, AgentVitals};
    use belief_nest_core::{BlockPos, Event, EventKind, LeverUse, Movement, Point};
    use belief_nest_world::PlayerSample;

    #[test]
    fn time_of_day_buckets() {
        let labels: Vec<&str> = [0, 999, 1_000, 6_000, 12_500, 13_000, 18_000, 22_000, 30_000]
            .into_iter()
            .map(time_of_day_label)
            .collect();
        assert_eq!(
            labels,
            vec!["sunrise", "sunrise", "day", "noon", "sunset", "night", "midnight", "sunrise", "noon"]
        );
    }

    #[test]
    fn samples_are_rounded_and_made_relative() {
        let sample = PlayerSample {
            position: Point::new(101.23456, 65.0, -29.5),
            yaw: 1.23456,
            inventory: [("dirt".to_owned(), 3)].into_iter().collect(),
            health: 17.0,
            time_of_day: 13_500,
            ..PlayerSample::default()
        };
        let status = agent_status(&sample, BlockPos::new(100, 64, -30), None);
        assert_eq!(status.visible.position, Some(Point::new(1.235, 1.0, 0.5)));
        assert_eq!(status.visible.yaw, Some(1.23));
        let hidden = status.hidden.expect("hidden part");
        assert_eq!(hidden.health, Some(17.0));
        assert_eq!(hidden.time_of_day.as_deref(), Some("night"));

        let reported = AgentVitals {
            health: 5.0,
            ..AgentVitals::default()
        };
        let status = agent_status(&sample, BlockPos::new(0, 0, 0), Some(&reported));
        let hidden = status.hidden.expect("hidden part");
        assert_eq!(hidden.health, Some(5.0));
        assert_eq!(hidden.inventory, Some(Default::default()));
    }

    #[test]
    fn event_coordinates_follow_the_offset() {
        let offset = BlockPos::new(10, 0, 10);
        let lever = relativize(
            Event::by_agent(
                "alice",
                EventKind::UseLever {
                    visible: LeverUse {
                        lever_pos: BlockPos::new(12, 3, 9),
                        kind: "on".to_owned(),
                    },
                },
            ),
            offset,
        );
        match lever.kind {
            EventKind::UseLever { visible } => assert_eq!(visible.lever_pos, BlockPos::new(2, 3, -1)),
            other => panic!("unexpected {}", other.name()),
        }
        let walk = relativize(
            Event::by_agent(
                "alice",
                EventKind::MoveTo {
                    visible: Movement {
                        start_pos: Point::new(10.5, 0.0, 10.5),
                        goal_pos: Point::new(15.0, 1.0, 10.0),
                    },
                },
            ),
            offset,
        );
        match walk.kind {
            EventKind::MoveTo { visible } => {
                assert_eq!(visible.start_pos, Point::new(0.5, 0.0, 0.5));
                assert_eq!(visible.goal_pos, Point::new(5.0, 1.0, 0.0));
            }
            other => panic!("unexpected {}", other.name()),
        }
    }
}
