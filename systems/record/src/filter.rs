//! Per-observer views of a tick.

use std::collections::BTreeMap;

use belief_nest_core::{AgentStatus, Event, PlayerVisibility, VisibilityGrid};

/// Status as the observer perceives it.
///
/// The observer keeps its own status whole. Visible agents lose their hidden
/// part. Unseen agents are dropped, or reduced to their pose when
/// `keep_unseen_poses` is set.
#[must_use]
pub fn filter_status(
    status: &BTreeMap<String, AgentStatus>,
    observer: &str,
    players: &PlayerVisibility,
    keep_unseen_poses: bool,
) -> BTreeMap<String, AgentStatus> {
    status
        .iter()
        .filter_map(|(agent, agent_status)| {
            let view = if agent == observer {
                agent_status.clone()
            } else if players.get(agent).copied().unwrap_or(false) {
                agent_status.without_hidden()
            } else if keep_unseen_poses {
                agent_status.pose_only()
            } else {
                return None;
            };
            Some((agent.clone(), view))
        })
        .collect()
}

/// Events the observer perceives.
///
/// Events anchored to a cell the observer cannot see are dropped, as are
/// events of agents it cannot see. Events of other visible agents lose their
/// hidden payload.
#[must_use]
pub fn filter_events(
    events: &[Event],
    observer: &str,
    players: &PlayerVisibility,
    blocks: Option<&VisibilityGrid>,
) -> Vec<Event> {
    events
        .iter()
        .filter(|event| match event.block_pos {
            Some(pos) => blocks.map_or(false, |grid| grid.contains(pos)),
            None => true,
        })
        .filter_map(|event| match event.agent_name.as_deref() {
            Some(agent) if agent == observer => Some(event.clone()),
            Some(agent) if players.get(agent).copied().unwrap_or(false) => event.without_hidden(),
            Some(_) => None,
            None => Some(event.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{filter_events, filter_status};
    use belief_nest_core::{
        AgentStatus, Block, BlockPos, ChatLine, Event, EventKind, HiddenStatus, Point, Thought,
        VisibilityGrid, VisibleStatus,
    };

    fn status_of(x: f64) -> AgentStatus {
        AgentStatus {
            visible: VisibleStatus {
                position: Some(Point::new(x, 0.0, 0.0)),
                equipment: Some(vec![None; 6]),
                ..VisibleStatus::default()
            },
            hidden: Some(HiddenStatus {
                health: Some(20.0),
                ..HiddenStatus::default()
            }),
        }
    }

    fn statuses() -> BTreeMap<String, AgentStatus> {
        [
            ("alice".to_owned(), status_of(0.0)),
            ("bob".to_owned(), status_of(1.0)),
            ("carol".to_owned(), status_of(2.0)),
        ]
        .into_iter()
        .collect()
    }

    fn players() -> BTreeMap<String, bool> {
        [("bob".to_owned(), true), ("carol".to_owned(), false)]
            .into_iter()
            .collect()
    }

    #[test]
    fn status_keeps_self_whole_and_strips_others() {
        let filtered = filter_status(&statuses(), "alice", &players(), false);
        assert!(filtered["alice"].hidden.is_some());
        assert!(filtered["bob"].hidden.is_none());
        assert!(filtered["bob"].visible.equipment.is_some());
        assert!(!filtered.contains_key("carol"));
    }

    #[test]
    fn unseen_agents_keep_only_their_pose_when_requested() {
        let filtered = filter_status(&statuses(), "alice", &players(), true);
        let carol = &filtered["carol"];
        assert_eq!(carol.visible.position, Some(Point::new(2.0, 0.0, 0.0)));
        assert!(carol.visible.equipment.is_none());
        assert!(carol.hidden.is_none());
    }

    #[test]
    fn events_follow_agent_and_cell_visibility() {
        let mut grid = VisibilityGrid::new(BlockPos::new(0, 0, 0), BlockPos::new(3, 3, 3));
        grid.add(BlockPos::new(1, 1, 1)).expect("inside");
        let chat = |agent: &str| {
            Event::by_agent(
                agent,
                EventKind::Chat {
                    visible: ChatLine {
                        agent_name: agent.to_owned(),
                        msg: "hi".to_owned(),
                    },
                },
            )
        };
        let events = vec![
            Event::block_update(BlockPos::new(1, 1, 1), Block::named("stone")),
            Event::block_update(BlockPos::new(2, 2, 2), Block::named("stone")),
            chat("alice"),
            chat("bob"),
            chat("carol"),
            Event::by_agent(
                "bob",
                EventKind::Think {
                    hidden: Thought {
                        msg: "secret".to_owned(),
                    },
                },
            ),
        ];
        let filtered = filter_events(&events, "alice", &players(), Some(&grid));
        let summary: Vec<(&str, Option<&str>)> = filtered
            .iter()
            .map(|event| (event.kind.name(), event.agent_name.as_deref()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("blockUpdate", None),
                ("chat", Some("alice")),
                ("chat", Some("bob")),
            ]
        );
        assert!(filter_events(&events[..1], "alice", &players(), None).is_empty());
    }
}
