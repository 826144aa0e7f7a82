use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{BlockPos, Point, VisibilityGrid};

/// Block type that carries a container.
pub const CONTAINER_BLOCK: &str = "chest";

/// Number of equipment slots reported per agent.
pub const EQUIPMENT_SLOTS: usize = 6;

/// Item counts keyed by item type name.
pub type ItemCounts = BTreeMap<String, u32>;

/// Whether each other agent is visible from an observer.
pub type PlayerVisibility = BTreeMap<String, bool>;

/// State of a single block cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Block type name.
    pub name: String,
    /// Opaque numeric state used to resolve the block's shapes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<u32>,
    /// Free-form block properties such as orientation or redstone power.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, serde_json::Value>>,
}

impl Block {
    /// Creates a block without state or properties.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state_id: None,
            properties: None,
        }
    }

    /// Attaches a state id.
    #[must_use]
    pub fn with_state(mut self, state_id: u32) -> Self {
        self.state_id = Some(state_id);
        self
    }

    /// Whether the block holds a container.
    #[must_use]
    pub fn is_container(&self) -> bool {
        self.name == CONTAINER_BLOCK
    }
}

/// Block state together with the cell it applies to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockUpdate {
    /// Cell the block occupies.
    pub position: BlockPos,
    /// New block state.
    #[serde(flatten)]
    pub block: Block,
}

impl BlockUpdate {
    /// Creates an update.
    #[must_use]
    pub fn new(position: BlockPos, block: Block) -> Self {
        Self { position, block }
    }
}

/// Explicit block patch; a missing name removes the block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockPatch {
    /// Cell to patch.
    pub position: [i32; 3],
    /// New block type, or `None` to forget the cell.
    pub name: Option<String>,
    /// Properties for the new block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, serde_json::Value>>,
}

/// Explicit container patch; missing items remove the container.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContainerPatch {
    /// Cell holding the container.
    pub position: [i32; 3],
    /// New contents, or `None` to forget the container.
    pub items: Option<ItemCounts>,
}

/// Part of an agent's status that line of sight exposes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleStatus {
    /// Feet position relative to the world offset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    /// Velocity in blocks per tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<Point>,
    /// Horizontal look angle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yaw: Option<f64>,
    /// Vertical look angle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f64>,
    /// Whether the agent stands on a block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_ground: Option<bool>,
    /// Item type per equipment slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment: Option<Vec<Option<String>>>,
    /// Whether the agent is submerged in water.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_in_water: Option<bool>,
    /// Whether the agent is submerged in lava.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_in_lava: Option<bool>,
    /// Whether the agent is caught in a web.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_in_web: Option<bool>,
}

impl VisibleStatus {
    /// Keeps only position and orientation.
    #[must_use]
    pub fn pose_only(&self) -> Self {
        Self {
            position: self.position,
            velocity: self.velocity,
            yaw: self.yaw,
            pitch: self.pitch,
            on_ground: self.on_ground,
            ..Self::default()
        }
    }

    /// Clears position and orientation.
    pub fn clear_pose(&mut self) {
        self.position = None;
        self.velocity = None;
        self.yaw = None;
        self.pitch = None;
        self.on_ground = None;
    }
}

/// Part of an agent's status only the agent itself knows.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HiddenStatus {
    /// Inventory contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<ItemCounts>,
    /// Health points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<f64>,
    /// Food level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub food: Option<f64>,
    /// Food saturation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saturation: Option<f64>,
    /// Remaining breath.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oxygen: Option<f64>,
    /// Whether the agent touches a wall.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_collided_horizontally: Option<bool>,
    /// Whether the agent touches a floor or ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_collided_vertically: Option<bool>,
    /// Biome name at the agent's position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub biome: Option<String>,
    /// Bucketed time of day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_of_day: Option<String>,
}

/// Full status of an agent at a tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    /// Observable part.
    pub visible: VisibleStatus,
    /// Private part, absent when unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<HiddenStatus>,
}

impl AgentStatus {
    /// Whether authoritative inventory contents are known.
    #[must_use]
    pub fn has_inventory(&self) -> bool {
        self.hidden
            .as_ref()
            .map_or(false, |hidden| hidden.inventory.is_some())
    }

    /// Copy without the private part.
    #[must_use]
    pub fn without_hidden(&self) -> Self {
        Self {
            visible: self.visible.clone(),
            hidden: None,
        }
    }

    /// Copy carrying only the pose of the visible part.
    #[must_use]
    pub fn pose_only(&self) -> Self {
        Self {
            visible: self.visible.pose_only(),
            hidden: None,
        }
    }

    /// Inventory, created empty when missing.
    pub fn inventory_mut(&mut self) -> &mut ItemCounts {
        self.hidden
            .get_or_insert_with(HiddenStatus::default)
            .inventory
            .get_or_insert_with(ItemCounts::new)
    }
}

/// Line of chat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatLine {
    /// Speaker.
    pub agent_name: String,
    /// Message text.
    pub msg: String,
}

/// Block broken by an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinedBlock {
    /// Cell of the broken block.
    pub pos: BlockPos,
    /// Type of the broken block.
    pub block_name: String,
}

/// Crafted item and its ingredients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CraftedItem {
    /// Produced item type.
    pub item_name: String,
    /// Number of items produced.
    pub count: u32,
    /// Ingredients used up.
    #[serde(default)]
    pub consumed_items: ItemCounts,
}

/// Smelted item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmeltedItem {
    /// Produced item type.
    pub item_name: String,
    /// Number of items produced.
    pub count: u32,
    /// Ingredients and fuel used up.
    #[serde(default, skip_serializing_if = "ItemCounts::is_empty")]
    pub consumed_items: ItemCounts,
}

/// Items taken out of a chest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChestWithdrawal {
    /// Chest cell; required to update container memory.
    #[serde(default)]
    pub chest_pos: Option<BlockPos>,
    /// Items taken.
    pub got_items: ItemCounts,
}

/// Items put into a chest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChestDeposit {
    /// Chest cell; required to update container memory.
    #[serde(default)]
    pub chest_pos: Option<BlockPos>,
    /// Items put in.
    pub deposited_items: ItemCounts,
}

/// Exact chest contents after a chest interaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChestContents {
    /// Contents after the interaction.
    pub chest_items: ItemCounts,
}

/// Items handed between two agents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemTransfer {
    /// Counterpart of the transfer.
    pub other_agent_name: String,
    /// Transferred item type.
    pub item_name: String,
    /// Number of items.
    pub count: u32,
}

/// Walk from one point to another.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movement {
    /// Where the walk started.
    pub start_pos: Point,
    /// Where the walk was headed.
    pub goal_pos: Point,
}

/// Private thought.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    /// Thought text.
    pub msg: String,
}

/// Lever toggle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeverUse {
    /// Lever cell.
    pub lever_pos: BlockPos,
    /// Kind of toggle, for example `on` or `off`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Payload of an event, tagged by its name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventName", rename_all = "camelCase")]
pub enum EventKind {
    /// A block changed.
    BlockUpdate {
        /// New block state.
        visible: Block,
    },
    /// An agent spoke.
    Chat {
        /// Spoken line.
        visible: ChatLine,
    },
    /// An agent broke a block.
    MineBlock {
        /// Broken block.
        visible: MinedBlock,
    },
    /// An agent crafted an item.
    CraftItem {
        /// Crafted item.
        visible: CraftedItem,
    },
    /// An agent smelted an item.
    SmeltItem {
        /// Smelted item.
        visible: SmeltedItem,
    },
    /// An agent took items out of a chest.
    GetItemFromChest {
        /// Items taken.
        visible: ChestWithdrawal,
        /// Exact chest contents afterwards.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hidden: Option<ChestContents>,
    },
    /// An agent put items into a chest.
    DepositItemIntoChest {
        /// Items put in.
        visible: ChestDeposit,
        /// Exact chest contents afterwards.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hidden: Option<ChestContents>,
    },
    /// An agent handed items to another.
    GiveItemToOther {
        /// Transfer details.
        visible: ItemTransfer,
    },
    /// An agent received items from another.
    ReceiveItemFromOther {
        /// Transfer details.
        visible: ItemTransfer,
    },
    /// An agent walked somewhere.
    MoveTo {
        /// Walk details.
        visible: Movement,
    },
    /// An agent thought something.
    Think {
        /// Thought text.
        hidden: Thought,
    },
    /// An agent toggled a lever.
    UseLever {
        /// Toggle details.
        visible: LeverUse,
    },
}

/// How often an event kind is collected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventClass {
    /// Collected on block observation ticks.
    Block,
    /// Collected on every sampled tick.
    Player,
}

impl EventKind {
    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            EventKind::BlockUpdate { .. } => "blockUpdate",
            EventKind::Chat { .. } => "chat",
            EventKind::MineBlock { .. } => "mineBlock",
            EventKind::CraftItem { .. } => "craftItem",
            EventKind::SmeltItem { .. } => "smeltItem",
            EventKind::GetItemFromChest { .. } => "getItemFromChest",
            EventKind::DepositItemIntoChest { .. } => "depositItemIntoChest",
            EventKind::GiveItemToOther { .. } => "giveItemToOther",
            EventKind::ReceiveItemFromOther { .. } => "receiveItemFromOther",
            EventKind::MoveTo { .. } => "moveTo",
            EventKind::Think { .. } => "think",
            EventKind::UseLever { .. } => "useLever",
        }
    }

    /// Collection class of the event.
    #[must_use]
    pub const fn class(&self) -> EventClass {
        match self {
            EventKind::BlockUpdate { .. } => EventClass::Block,
            _ => EventClass::Player,
        }
    }
}

/// Discrete occurrence recorded at a tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Acting agent, for agent-anchored events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Anchoring cell, for spatially anchored events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_pos: Option<BlockPos>,
    /// Named payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Event performed by an agent.
    #[must_use]
    pub fn by_agent(agent: impl Into<String>, kind: EventKind) -> Self {
        Self {
            agent_name: Some(agent.into()),
            block_pos: None,
            kind,
        }
    }

    /// Block change at a cell.
    #[must_use]
    pub fn block_update(pos: BlockPos, block: Block) -> Self {
        Self {
            agent_name: None,
            block_pos: Some(pos),
            kind: EventKind::BlockUpdate { visible: block },
        }
    }

    /// Copy with every private payload removed. `think` events become `None`
    /// because they have nothing else to show.
    #[must_use]
    pub fn without_hidden(&self) -> Option<Self> {
        let kind = match &self.kind {
            EventKind::Think { .. } => return None,
            EventKind::GetItemFromChest { visible, .. } => EventKind::GetItemFromChest {
                visible: visible.clone(),
                hidden: None,
            },
            EventKind::DepositItemIntoChest { visible, .. } => EventKind::DepositItemIntoChest {
                visible: visible.clone(),
                hidden: None,
            },
            other => other.clone(),
        };
        Some(Self {
            agent_name: self.agent_name.clone(),
            block_pos: self.block_pos,
            kind,
        })
    }
}

/// What one observer could see at a tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Visibility {
    /// Visibility of every other agent.
    pub players: PlayerVisibility,
    /// Visible cells, absent on ticks without block observation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<VisibilityGrid>,
}

/// Everything recorded at one tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Events in occurrence order.
    #[serde(default)]
    pub events: Vec<Event>,
    /// Status per agent.
    #[serde(default)]
    pub status: BTreeMap<String, AgentStatus>,
    /// Visibility of the record's viewpoint, when computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    /// Blocks that changed at this tick.
    #[serde(default)]
    pub updated_blocks: Vec<BlockUpdate>,
}

#[cfg(test)]
mod tests {
    use super::{
        AgentStatus, Block, ChestContents, ChestWithdrawal, Event, EventClass, EventKind,
        HiddenStatus, ItemCounts, Thought,
    };
    use crate::BlockPos;

    fn items(pairs: &[(&str, u32)]) -> ItemCounts {
        pairs.iter().map(|(name, count)| ((*name).to_owned(), *count)).collect()
    }

    #[test]
    fn events_serialize_with_their_name_inline() {
        let event = Event::block_update(BlockPos::new(1, 2, 3), Block::named("stone").with_state(1));
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "blockPos": {"__Vec3__": [1.0, 2.0, 3.0]},
                "eventName": "blockUpdate",
                "visible": {"name": "stone", "stateId": 1}
            })
        );
        let restored: Event = serde_json::from_value(json).expect("deserialize");
        assert_eq!(restored, event);
        assert_eq!(restored.kind.class(), EventClass::Block);
    }

    #[test]
    fn chest_events_drop_contents_when_hidden_is_stripped() {
        let event = Event::by_agent(
            "alice",
            EventKind::GetItemFromChest {
                visible: ChestWithdrawal {
                    chest_pos: Some(BlockPos::new(0, 0, 0)),
                    got_items: items(&[("dirt", 2)]),
                },
                hidden: Some(ChestContents {
                    chest_items: items(&[("dirt", 5)]),
                }),
            },
        );
        let stripped = event.without_hidden().expect("chest events stay visible");
        match stripped.kind {
            EventKind::GetItemFromChest { hidden, .. } => assert!(hidden.is_none()),
            other => panic!("unexpected kind {}", other.name()),
        }
        assert_eq!(event.kind.class(), EventClass::Player);
    }

    #[test]
    fn thoughts_vanish_without_hidden_payload() {
        let event = Event::by_agent(
            "alice",
            EventKind::Think {
                hidden: Thought {
                    msg: "hmm".to_owned(),
                },
            },
        );
        assert!(event.without_hidden().is_none());
    }

    #[test]
    fn inventory_presence_follows_hidden_status() {
        let mut status = AgentStatus::default();
        assert!(!status.has_inventory());
        status.hidden = Some(HiddenStatus::default());
        assert!(!status.has_inventory());
        let _ = status.inventory_mut().insert("dirt".to_owned(), 1);
        assert!(status.has_inventory());
        assert!(status.without_hidden().hidden.is_none());
    }
}
