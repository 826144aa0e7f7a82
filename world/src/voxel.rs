//! In-memory voxel world.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use belief_nest_core::{
    Block, BlockPos, BlockUpdate, ChatLine, ChestContents, ChestDeposit, ChestWithdrawal,
    CraftedItem, EnvBox, Event, EventKind, ItemCounts, ItemTransfer, MinedBlock, Movement, Point,
    Thought, EQUIPMENT_SLOTS,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{
    ExecutionOutcome, GameWorld, PlayerSample, ShapeCatalog, WorldAddress, WorldConnector,
    WorldError,
};

const CHANGE_CAPACITY: usize = 1024;
const DEFAULT_TIME_OF_DAY: u32 = 6000;

#[derive(Clone, Debug)]
struct VoxelPlayer {
    position: Point,
    yaw: f64,
    pitch: f64,
    inventory: ItemCounts,
    equipment: Vec<Option<String>>,
    transparent: bool,
    moving: bool,
    pinned: bool,
}

impl VoxelPlayer {
    fn spawn() -> Self {
        Self {
            position: Point::default(),
            yaw: 0.0,
            pitch: 0.0,
            inventory: ItemCounts::new(),
            equipment: vec![None; EQUIPMENT_SLOTS],
            transparent: false,
            moving: false,
            pinned: false,
        }
    }
}

#[derive(Debug, Default)]
struct VoxelState {
    blocks: BTreeMap<BlockPos, Block>,
    containers: BTreeMap<BlockPos, ItemCounts>,
    players: BTreeMap<String, VoxelPlayer>,
    failing: BTreeSet<BlockPos>,
    time_of_day: u32,
}

/// Mutation applied to a [`VoxelState`].
#[derive(Clone, Debug)]
enum VoxelCommand {
    Place(BlockUpdate),
    Clear(EnvBox),
    Fill { pos: BlockPos, items: ItemCounts },
    Move { player: String, to: Point },
}

/// Applies a command, collecting the resulting block changes.
fn apply(
    state: &mut VoxelState,
    command: VoxelCommand,
    changes: &mut Vec<BlockUpdate>,
) -> Result<(), WorldError> {
    match command {
        VoxelCommand::Place(update) => {
            if state.failing.contains(&update.position) {
                return Err(WorldError::Placement {
                    pos: update.position,
                    reason: "cell rejects placements".to_owned(),
                });
            }
            if !update.block.is_container() {
                let _ = state.containers.remove(&update.position);
            } else {
                let _ = state.containers.entry(update.position).or_default();
            }
            if update.block.name == "air" {
                let _ = state.blocks.remove(&update.position);
            } else {
                let _ = state.blocks.insert(update.position, update.block.clone());
            }
            changes.push(update);
        }
        VoxelCommand::Clear(env_box) => {
            let inside: Vec<BlockPos> = state
                .blocks
                .keys()
                .copied()
                .filter(|pos| env_box.contains(*pos))
                .collect();
            for pos in inside {
                let _ = state.blocks.remove(&pos);
                let _ = state.containers.remove(&pos);
                changes.push(BlockUpdate::new(pos, Block::named("air")));
            }
        }
        VoxelCommand::Fill { pos, items } => {
            let _ = state.containers.insert(pos, items);
        }
        VoxelCommand::Move { player, to } => {
            let entry = state
                .players
                .get_mut(&player)
                .ok_or_else(|| WorldError::UnknownPlayer(player.clone()))?;
            if !entry.pinned {
                entry.position = to;
            }
        }
    }
    Ok(())
}

/// Read-only views of a [`VoxelWorld`].
pub mod query {
    use belief_nest_core::{BlockPos, ItemCounts};

    use super::VoxelWorld;

    /// Contents of the container at a cell.
    #[must_use]
    pub fn container(world: &VoxelWorld, pos: BlockPos) -> Option<ItemCounts> {
        world.state.lock().containers.get(&pos).cloned()
    }

    /// Whether a player is hidden.
    #[must_use]
    pub fn is_transparent(world: &VoxelWorld, player: &str) -> Option<bool> {
        world
            .state
            .lock()
            .players
            .get(player)
            .map(|entry| entry.transparent)
    }

    /// Equipment worn by a player.
    #[must_use]
    pub fn equipment(world: &VoxelWorld, player: &str) -> Option<Vec<Option<String>>> {
        world
            .state
            .lock()
            .players
            .get(player)
            .map(|entry| entry.equipment.clone())
    }

    /// Number of non-air blocks.
    #[must_use]
    pub fn block_count(world: &VoxelWorld) -> usize {
        world.state.lock().blocks.len()
    }
}

/// In-memory game world with optional fault injection.
#[derive(Debug)]
pub struct VoxelWorld {
    state: Mutex<VoxelState>,
    catalog: ShapeCatalog,
    changes: broadcast::Sender<BlockUpdate>,
}

impl Default for VoxelWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl VoxelWorld {
    /// Creates an empty world using the standard shape catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::with_catalog(ShapeCatalog::standard())
    }

    /// Creates an empty world using the provided catalog.
    #[must_use]
    pub fn with_catalog(catalog: ShapeCatalog) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            state: Mutex::new(VoxelState {
                time_of_day: DEFAULT_TIME_OF_DAY,
                ..VoxelState::default()
            }),
            catalog,
            changes,
        }
    }

    /// Makes every later placement at the cell fail.
    pub fn fail_placements_at(&self, pos: BlockPos) {
        let _ = self.state.lock().failing.insert(pos);
    }

    /// Makes the player ignore movement requests.
    pub fn pin_player(&self, player: &str) {
        if let Some(entry) = self.state.lock().players.get_mut(player) {
            entry.pinned = true;
        }
    }

    /// Marks the player as walking or standing.
    pub fn set_moving(&self, player: &str, moving: bool) {
        if let Some(entry) = self.state.lock().players.get_mut(player) {
            entry.moving = moving;
        }
    }

    /// Sets the game time of day.
    pub fn set_time_of_day(&self, ticks: u32) {
        self.state.lock().time_of_day = ticks % 24_000;
    }

    fn mutate(&self, commands: Vec<VoxelCommand>) -> Result<(), WorldError> {
        let mut changes = Vec::new();
        let result = {
            let mut state = self.state.lock();
            commands
                .into_iter()
                .try_for_each(|command| apply(&mut state, command, &mut changes))
        };
        for change in changes {
            trace!(pos = %change.position, name = %change.block.name, "block changed");
            let _ = self.changes.send(change);
        }
        result
    }

    fn with_state_id(&self, mut block: Block) -> Block {
        if block.state_id.is_none() {
            block.state_id = self.catalog.default_state(&block.name);
        }
        block
    }

    fn run_line(&self, player: &str, line: &str) -> Result<Vec<Event>, String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = words.split_first() else {
            return Ok(Vec::new());
        };
        let rest = || line.trim_start()[verb.len()..].trim().to_owned();
        match verb {
            "chat" => Ok(vec![Event::by_agent(
                player,
                EventKind::Chat {
                    visible: ChatLine {
                        agent_name: player.to_owned(),
                        msg: rest(),
                    },
                },
            )]),
            "think" => Ok(vec![Event::by_agent(
                player,
                EventKind::Think {
                    hidden: Thought { msg: rest() },
                },
            )]),
            "place" => {
                let pos = parse_pos(args)?;
                let name = args.get(3).ok_or("place needs a block name")?;
                let block = self.with_state_id(Block::named(*name));
                self.mutate(vec![VoxelCommand::Place(BlockUpdate::new(pos, block))])
                    .map_err(|error| error.to_string())?;
                Ok(Vec::new())
            }
            "mine" => {
                let pos = parse_pos(args)?;
                let mined = self
                    .state
                    .lock()
                    .blocks
                    .get(&pos)
                    .cloned()
                    .ok_or_else(|| format!("nothing to mine at {pos}"))?;
                self.mutate(vec![VoxelCommand::Place(BlockUpdate::new(
                    pos,
                    self.with_state_id(Block::named("air")),
                ))])
                .map_err(|error| error.to_string())?;
                self.adjust_inventory(player, &mined.name, 1)?;
                Ok(vec![Event::by_agent(
                    player,
                    EventKind::MineBlock {
                        visible: MinedBlock {
                            pos,
                            block_name: mined.name,
                        },
                    },
                )])
            }
            "move" => {
                let goal = parse_point(args)?;
                let start = self
                    .state
                    .lock()
                    .players
                    .get(player)
                    .map(|entry| entry.position)
                    .ok_or_else(|| format!("unknown player {player}"))?;
                self.mutate(vec![VoxelCommand::Move {
                    player: player.to_owned(),
                    to: goal,
                }])
                .map_err(|error| error.to_string())?;
                Ok(vec![Event::by_agent(
                    player,
                    EventKind::MoveTo {
                        visible: Movement {
                            start_pos: start,
                            goal_pos: goal,
                        },
                    },
                )])
            }
            "craft" => {
                let item = args.first().ok_or("craft needs an item")?;
                let count = parse_count(args.get(1))?;
                let mut consumed = ItemCounts::new();
                for ingredient in args.iter().skip(2) {
                    let (name, amount) = ingredient
                        .split_once(':')
                        .ok_or_else(|| format!("bad ingredient {ingredient}"))?;
                    let _ = consumed.insert(name.to_owned(), parse_count(Some(&amount))?);
                }
                for (name, amount) in &consumed {
                    self.adjust_inventory(player, name, -i64::from(*amount))?;
                }
                self.adjust_inventory(player, item, i64::from(count))?;
                Ok(vec![Event::by_agent(
                    player,
                    EventKind::CraftItem {
                        visible: CraftedItem {
                            item_name: (*item).to_owned(),
                            count,
                            consumed_items: consumed,
                        },
                    },
                )])
            }
            "give" => {
                let other = args.first().copied().ok_or("give needs a recipient")?;
                let item = args.get(1).copied().ok_or("give needs an item")?;
                let count = parse_count(args.get(2))?;
                self.adjust_inventory(player, item, -i64::from(count))?;
                self.adjust_inventory(other, item, i64::from(count))?;
                let transfer = |counterpart: &str| ItemTransfer {
                    other_agent_name: counterpart.to_owned(),
                    item_name: item.to_owned(),
                    count,
                };
                Ok(vec![
                    Event::by_agent(
                        player,
                        EventKind::GiveItemToOther {
                            visible: transfer(other),
                        },
                    ),
                    Event::by_agent(
                        other,
                        EventKind::ReceiveItemFromOther {
                            visible: transfer(player),
                        },
                    ),
                ])
            }
            "deposit" | "withdraw" => {
                let pos = parse_pos(args)?;
                let item = args.get(3).copied().ok_or("chest use needs an item")?;
                let count = parse_count(args.get(4))?;
                let signed = if verb == "deposit" {
                    i64::from(count)
                } else {
                    -i64::from(count)
                };
                if !self.state.lock().containers.contains_key(&pos) {
                    return Err(format!("no chest at {pos}"));
                }
                self.adjust_inventory(player, item, -signed)?;
                let contents = {
                    let mut state = self.state.lock();
                    let chest = state.containers.entry(pos).or_default();
                    let adjusted = adjust(chest, item, signed).map(|()| chest.clone());
                    drop(state);
                    if adjusted.is_err() {
                        self.adjust_inventory(player, item, signed)?;
                    }
                    adjusted?
                };
                let moved: ItemCounts = [(item.to_owned(), count)].into_iter().collect();
                let hidden = Some(ChestContents {
                    chest_items: contents,
                });
                let kind = if verb == "deposit" {
                    EventKind::DepositItemIntoChest {
                        visible: ChestDeposit {
                            chest_pos: Some(pos),
                            deposited_items: moved,
                        },
                        hidden,
                    }
                } else {
                    EventKind::GetItemFromChest {
                        visible: ChestWithdrawal {
                            chest_pos: Some(pos),
                            got_items: moved,
                        },
                        hidden,
                    }
                };
                Ok(vec![Event::by_agent(player, kind)])
            }
            other => Err(format!("unknown instruction `{other}`")),
        }
    }

    fn adjust_inventory(&self, player: &str, item: &str, delta: i64) -> Result<(), String> {
        let mut state = self.state.lock();
        let entry = state
            .players
            .get_mut(player)
            .ok_or_else(|| format!("unknown player {player}"))?;
        adjust(&mut entry.inventory, item, delta)
    }
}

fn adjust(items: &mut ItemCounts, item: &str, delta: i64) -> Result<(), String> {
    let current = i64::from(items.get(item).copied().unwrap_or(0));
    let next = current + delta;
    if next < 0 {
        return Err(format!("not enough {item}: have {current}, need {}", -delta));
    }
    if next == 0 {
        let _ = items.remove(item);
    } else {
        let _ = items.insert(item.to_owned(), u32::try_from(next).unwrap_or(u32::MAX));
    }
    Ok(())
}

fn parse_pos(args: &[&str]) -> Result<BlockPos, String> {
    let mut coords = [0_i32; 3];
    for (slot, index) in coords.iter_mut().zip(0..3) {
        *slot = args
            .get(index)
            .and_then(|value| value.parse().ok())
            .ok_or("expected integer coordinates")?;
    }
    Ok(BlockPos::from(coords))
}

fn parse_point(args: &[&str]) -> Result<Point, String> {
    let mut coords = [0_f64; 3];
    for (slot, index) in coords.iter_mut().zip(0..3) {
        *slot = args
            .get(index)
            .and_then(|value| value.parse().ok())
            .ok_or("expected numeric coordinates")?;
    }
    Ok(Point::new(coords[0], coords[1], coords[2]))
}

fn parse_count(arg: Option<&&str>) -> Result<u32, String> {
    arg.and_then(|value| value.parse().ok())
        .ok_or_else(|| "expected a count".to_owned())
}

#[async_trait]
impl GameWorld for VoxelWorld {
    fn catalog(&self) -> &ShapeCatalog {
        &self.catalog
    }

    fn subscribe_block_changes(&self) -> broadcast::Receiver<BlockUpdate> {
        self.changes.subscribe()
    }

    async fn player_names(&self) -> Vec<String> {
        self.state.lock().players.keys().cloned().collect()
    }

    async fn connect_player(&self, game_name: &str) -> Result<(), WorldError> {
        let mut state = self.state.lock();
        if state.players.contains_key(game_name) {
            return Err(WorldError::PlayerExists(game_name.to_owned()));
        }
        let _ = state
            .players
            .insert(game_name.to_owned(), VoxelPlayer::spawn());
        debug!(player = game_name, "player connected");
        Ok(())
    }

    async fn disconnect_player(&self, game_name: &str) -> Result<(), WorldError> {
        self.state
            .lock()
            .players
            .remove(game_name)
            .map(|_| ())
            .ok_or_else(|| WorldError::UnknownPlayer(game_name.to_owned()))
    }

    async fn sample_player(&self, game_name: &str) -> Option<PlayerSample> {
        let state = self.state.lock();
        let entry = state.players.get(game_name)?;
        let below = entry.position.floor().offset(BlockPos::new(0, -1, 0));
        Some(PlayerSample {
            position: entry.position,
            velocity: Point::default(),
            yaw: entry.yaw,
            pitch: entry.pitch,
            on_ground: state.blocks.contains_key(&below),
            equipment: entry.equipment.clone(),
            inventory: entry.inventory.clone(),
            health: 20.0,
            food: 20.0,
            saturation: 5.0,
            oxygen: 20.0,
            biome: "plains".to_owned(),
            time_of_day: state.time_of_day,
            ..PlayerSample::default()
        })
    }

    async fn is_moving(&self, game_name: &str) -> bool {
        self.state
            .lock()
            .players
            .get(game_name)
            .map_or(false, |entry| entry.moving)
    }

    async fn block_at(&self, pos: BlockPos) -> Option<Block> {
        self.state.lock().blocks.get(&pos).cloned()
    }

    async fn set_blocks(&self, updates: &[BlockUpdate]) -> Result<(), WorldError> {
        let commands = updates
            .iter()
            .map(|update| {
                VoxelCommand::Place(BlockUpdate::new(
                    update.position,
                    self.with_state_id(update.block.clone()),
                ))
            })
            .collect();
        self.mutate(commands)
    }

    async fn clear_box(&self, env_box: EnvBox) -> Result<(), WorldError> {
        self.mutate(vec![VoxelCommand::Clear(env_box)])
    }

    async fn set_container(&self, pos: BlockPos, items: &ItemCounts) -> Result<(), WorldError> {
        self.mutate(vec![VoxelCommand::Fill {
            pos,
            items: items.clone(),
        }])
    }

    async fn move_player(&self, game_name: &str, to: Point) -> Result<(), WorldError> {
        self.mutate(vec![VoxelCommand::Move {
            player: game_name.to_owned(),
            to,
        }])
    }

    async fn set_inventory_and_equipment(
        &self,
        game_name: &str,
        inventory: &ItemCounts,
        equipment: &[Option<String>],
    ) -> Result<(), WorldError> {
        let mut state = self.state.lock();
        let entry = state
            .players
            .get_mut(game_name)
            .ok_or_else(|| WorldError::UnknownPlayer(game_name.to_owned()))?;
        entry.inventory = inventory.clone();
        entry.equipment = equipment.to_vec();
        Ok(())
    }

    async fn set_equipment(
        &self,
        game_name: &str,
        equipment: &[Option<String>],
    ) -> Result<(), WorldError> {
        let mut state = self.state.lock();
        let entry = state
            .players
            .get_mut(game_name)
            .ok_or_else(|| WorldError::UnknownPlayer(game_name.to_owned()))?;
        entry.equipment = equipment.to_vec();
        Ok(())
    }

    async fn set_transparency(&self, game_name: &str, transparent: bool) -> Result<(), WorldError> {
        let mut state = self.state.lock();
        let entry = state
            .players
            .get_mut(game_name)
            .ok_or_else(|| WorldError::UnknownPlayer(game_name.to_owned()))?;
        entry.transparent = transparent;
        Ok(())
    }

    /// Runs a line-oriented program: `chat`, `think`, `place x y z name`,
    /// `mine x y z`, `move x y z`, `craft item n [ingredient:n ...]`,
    /// `give agent item n`, `deposit x y z item n` and `withdraw x y z item n`.
    async fn execute(&self, game_name: &str, program: &str) -> Result<ExecutionOutcome, WorldError> {
        if !self.state.lock().players.contains_key(game_name) {
            return Err(WorldError::UnknownPlayer(game_name.to_owned()));
        }
        let mut outcome = ExecutionOutcome {
            success: true,
            ..ExecutionOutcome::default()
        };
        for line in program.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match self.run_line(game_name, line) {
                Ok(events) => outcome.events.extend(events),
                Err(message) => {
                    outcome.success = false;
                    outcome.error_message = Some(message);
                    break;
                }
            }
        }
        Ok(outcome)
    }
}

/// Connector handing out in-memory worlds.
#[derive(Debug, Default)]
pub struct VoxelConnector {
    shared: Option<Arc<VoxelWorld>>,
}

impl VoxelConnector {
    /// Connector returning the same world for every address.
    #[must_use]
    pub fn shared(world: Arc<VoxelWorld>) -> Self {
        Self {
            shared: Some(world),
        }
    }
}

#[async_trait]
impl WorldConnector for VoxelConnector {
    async fn connect(&self, address: &WorldAddress) -> Result<Arc<dyn GameWorld>, WorldError> {
        debug!(%address, "opening in-memory world");
        let world = self
            .shared
            .clone()
            .unwrap_or_else(|| Arc::new(VoxelWorld::new()));
        Ok(world)
    }
}
