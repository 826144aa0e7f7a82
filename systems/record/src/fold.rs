//! Folding of one history entry into memory.

use std::collections::BTreeMap;

use belief_nest_core::{AgentStatus, BlockUpdate, Event, EventKind, ItemCounts, Tick};

use crate::{Memory, PositionMemory, RecordError};

/// Rejects entries whose chest events cannot be applied.
pub(crate) fn validate_events(tick: Tick, events: &[Event]) -> Result<(), RecordError> {
    for event in events {
        let chest_pos = match &event.kind {
            EventKind::GetItemFromChest { visible, .. } => visible.chest_pos,
            EventKind::DepositItemIntoChest { visible, .. } => visible.chest_pos,
            _ => continue,
        };
        if chest_pos.is_none() {
            return Err(RecordError::MissingChestPosition {
                event: event.kind.name(),
                tick,
            });
        }
    }
    Ok(())
}

/// Applies status, inferred inventories, block updates, container contents
/// and events of one tick. Callers validate the events first.
pub(crate) fn apply(
    memory: &mut Memory,
    tick: Tick,
    status: &BTreeMap<String, AgentStatus>,
    events: &[Event],
    updated_blocks: &[BlockUpdate],
    roster: &[String],
    policy: PositionMemory,
) {
    update_status(memory, status, roster, policy);
    infer_inventories(memory, status, events);
    for update in updated_blocks {
        let _ = memory.blocks.insert(update.position, update.block.clone());
    }
    update_containers(memory, events, updated_blocks);
    if !events.is_empty() {
        let _ = memory.events.insert(tick, events.to_vec());
    }
}

fn update_status(
    memory: &mut Memory,
    status: &BTreeMap<String, AgentStatus>,
    roster: &[String],
    policy: PositionMemory,
) {
    for agent in roster {
        let remembered = memory.status.entry(agent.clone()).or_default();
        match (status.get(agent), policy) {
            (Some(current), _) => {
                remembered.visible = current.visible.clone();
                if current.hidden.is_some() {
                    remembered.hidden = current.hidden.clone();
                }
            }
            (None, PositionMemory::LastSeen) => {}
            (None, PositionMemory::Current) => remembered.visible.clear_pose(),
        }
        let _ = remembered.inventory_mut();
    }
}

fn infer_inventories(memory: &mut Memory, status: &BTreeMap<String, AgentStatus>, events: &[Event]) {
    let known = |agent: &str| status.get(agent).map_or(false, AgentStatus::has_inventory);
    let add = |memory: &mut Memory, agent: &str, item: &str, count: u32| {
        if known(agent) {
            return;
        }
        let inventory = memory.status.entry(agent.to_owned()).or_default().inventory_mut();
        *inventory.entry(item.to_owned()).or_insert(0) += count;
    };
    let remove = |memory: &mut Memory, agent: &str, item: &str, count: u32| {
        if known(agent) {
            return;
        }
        let inventory = memory.status.entry(agent.to_owned()).or_default().inventory_mut();
        take(inventory, item, count);
    };

    for event in events {
        let Some(agent) = event.agent_name.as_deref() else {
            continue;
        };
        match &event.kind {
            EventKind::MineBlock { visible } => add(memory, agent, &visible.block_name, 1),
            EventKind::CraftItem { visible } => {
                add(memory, agent, &visible.item_name, visible.count);
                for (item, count) in &visible.consumed_items {
                    remove(memory, agent, item, *count);
                }
            }
            EventKind::GetItemFromChest { visible, .. } => {
                for (item, count) in &visible.got_items {
                    add(memory, agent, item, *count);
                }
            }
            EventKind::DepositItemIntoChest { visible, .. } => {
                for (item, count) in &visible.deposited_items {
                    remove(memory, agent, item, *count);
                }
            }
            EventKind::GiveItemToOther { visible } => {
                remove(memory, agent, &visible.item_name, visible.count);
                add(memory, &visible.other_agent_name, &visible.item_name, visible.count);
            }
            _ => {}
        }
    }
}

fn update_containers(memory: &mut Memory, events: &[Event], updated_blocks: &[BlockUpdate]) {
    for update in updated_blocks {
        if update.block.is_container() && !memory.containers.contains(update.position) {
            let _ = memory.containers.insert(update.position, ItemCounts::new());
        }
    }
    let blocks = &memory.blocks;
    memory
        .containers
        .retain(|pos, _| blocks.get(pos).map_or(true, |block| block.is_container()));

    for event in events {
        let (pos, exact) = match &event.kind {
            EventKind::GetItemFromChest { visible, hidden } => (visible.chest_pos, hidden),
            EventKind::DepositItemIntoChest { visible, hidden } => (visible.chest_pos, hidden),
            _ => continue,
        };
        let Some(pos) = pos else {
            continue;
        };
        if let Some(exact) = exact {
            let _ = memory.containers.insert(pos, exact.chest_items.clone());
            continue;
        }
        let chest = memory.containers.entry(pos).or_default();
        match &event.kind {
            EventKind::GetItemFromChest { visible, .. } => {
                for (item, count) in &visible.got_items {
                    take(chest, item, *count);
                }
            }
            EventKind::DepositItemIntoChest { visible, .. } => {
                for (item, count) in &visible.deposited_items {
                    *chest.entry(item.clone()).or_insert(0) += count;
                }
            }
            _ => {}
        }
    }
}

/// Removes up to `count` items, dropping the entry when none remain.
fn take(items: &mut ItemCounts, item: &str, count: u32) {
    let Some(held) = items.get_mut(item) else {
        return;
    };
    if count >= *held {
        let _ = items.remove(item);
    } else {
        *held -= count;
    }
}
