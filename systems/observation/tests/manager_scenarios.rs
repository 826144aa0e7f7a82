use std::{collections::BTreeMap, fs, path::Path, sync::Arc, time::Duration};

use belief_nest_core::{
    AgentStatus, BlockPatch, BlockPos, EnvBox, HistoryEntry, Point, PosMap, Tick, Visibility,
    VisibleStatus,
};
use belief_nest_system_observation::{
    checkpoint::{self, FileKind},
    replication_channel, ChildRequest, DownstreamPort, DumpOptions, ManagerSettings, Mode,
    ObservationConfig, ObservationError, ObservationManager, ParentReply, ReplicatedTick,
    StopOptions,
};
use belief_nest_system_record::{ObservationRecord, PositionMemory};
use belief_nest_world::{GameWorld, VoxelWorld};

const OFFSET: BlockPos = BlockPos::new(10, 0, 10);
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn settings(follow_period_ms: u64) -> ManagerSettings {
    ManagerSettings {
        config: ObservationConfig {
            tick_period_ms: 60_000,
            follow_period_ms,
            flush_period_ms: 60_000,
            progress_log_period_ms: 100,
            ..ObservationConfig::default()
        },
        env_box: EnvBox::new(BlockPos::new(0, 0, 0), BlockPos::new(15, 15, 15)),
        offset: OFFSET,
        eye_height: 1.62,
        static_block_types: vec!["bedrock".to_owned()],
    }
}

fn agents(names: &[&str]) -> BTreeMap<String, String> {
    names
        .iter()
        .map(|name| ((*name).to_owned(), format!("p_{name}")))
        .collect()
}

fn standing_at(x: f64) -> AgentStatus {
    AgentStatus {
        visible: VisibleStatus {
            position: Some(Point::new(x, 1.0, 2.0)),
            ..VisibleStatus::default()
        },
        hidden: None,
    }
}

fn seed_initial_state(dir: &Path, patches: &[BlockPatch]) {
    fs::create_dir_all(dir).expect("branch dir");
    let mut record = ObservationRecord::new_objective(PositionMemory::LastSeen);
    record.overwrite_state(patches, &[]);
    checkpoint::dump_initial_state(&record, dir, "").expect("initial state");
}

fn patch(position: [i32; 3], name: &str) -> BlockPatch {
    BlockPatch {
        position,
        name: Some(name.to_owned()),
        properties: None,
    }
}

async fn connected_world(names: &[&str]) -> Arc<VoxelWorld> {
    let world = Arc::new(VoxelWorld::new());
    for name in names {
        world
            .connect_player(&format!("p_{name}"))
            .await
            .expect("connect");
    }
    world
}

#[tokio::test]
async fn initial_load_seeds_agents_with_static_blocks_only() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("world[default]");
    seed_initial_state(
        &dir,
        &[
            patch([0, 0, 0], "bedrock"),
            patch([1, 0, 0], "stone"),
            patch([2, 0, 0], "dirt"),
        ],
    );

    let manager = ObservationManager::new(
        connected_world(&["alice", "bob"]).await,
        settings(60_000),
        &dir,
        None,
    );
    manager.set_agents(agents(&["alice", "bob"]));
    manager.load(false).await.expect("load");

    assert_eq!(manager.tick(), Tick::new(-1));
    assert_eq!(manager.objective_memory().blocks.len(), 3);
    for agent in ["alice", "bob"] {
        let memory = manager.subjective_memory(agent).expect("seeded record");
        let seeded: Vec<BlockPos> = memory.blocks.positions().collect();
        assert_eq!(seeded, vec![BlockPos::new(0, 0, 0)]);
        assert!(checkpoint::internal_dir(&dir)
            .join(format!("{agent}#state#-1.json"))
            .is_file());
    }
}

#[tokio::test]
async fn loading_without_snapshot_fails() {
    let root = tempfile::tempdir().expect("tempdir");
    let manager = ObservationManager::new(
        Arc::new(VoxelWorld::new()),
        settings(60_000),
        root.path().join("world[default]"),
        None,
    );
    assert!(matches!(
        manager.load(false).await,
        Err(ObservationError::MissingSnapshot(_))
    ));
}

#[tokio::test]
async fn lifecycle_preconditions_are_enforced() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("world[default]");
    seed_initial_state(&dir, &[]);
    let manager = ObservationManager::new(Arc::new(VoxelWorld::new()), settings(60_000), &dir, None);

    assert!(matches!(manager.start(), Err(ObservationError::ModeNotSet)));
    assert!(matches!(
        manager
            .stop(StopOptions {
                strict: true,
                force: false
            })
            .await,
        Err(ObservationError::NotActive)
    ));
    manager.switch_mode(Mode::Follow).expect("mode");
    assert!(matches!(manager.start(), Err(ObservationError::NoParent)));

    manager.switch_mode(Mode::Observe).expect("mode");
    manager.start().expect("start");
    assert!(manager.status().active);
    assert!(matches!(
        manager.switch_mode(Mode::Follow),
        Err(ObservationError::AlreadyStarted(_))
    ));
    assert!(matches!(
        manager.load(false).await,
        Err(ObservationError::AlreadyStarted(_))
    ));
    manager.stop(StopOptions::default()).await.expect("stop");
    assert!(!manager.status().active);
}

#[tokio::test]
async fn observed_ticks_are_replicated_once_per_request() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("world[default]");
    seed_initial_state(&dir, &[]);
    let world = connected_world(&["alice", "bob"]).await;
    world
        .move_player("p_alice", Point::new(12.5, 1.0, 12.5))
        .await
        .expect("move");
    world
        .move_player("p_bob", Point::new(16.5, 1.0, 12.5))
        .await
        .expect("move");
    let manager = ObservationManager::new(world, settings(60_000), &dir, None);
    manager.set_agents(agents(&["alice", "bob"]));
    manager.load(false).await.expect("load");
    manager.switch_mode(Mode::Observe).expect("mode");
    manager.observe_now().await.expect("tick 0");
    manager.observe_now().await.expect("tick 1");
    assert_eq!(manager.tick(), Tick::new(1));

    let mut child = manager.attach_child("alice");
    child
        .request(ChildRequest::Fetch {
            prev_tick: Tick::new(-1),
        })
        .expect("request");
    assert_eq!(manager.flush_children().expect("flush"), 1);

    let Some(ParentReply::Fetch(ticks)) = child.next_reply().await else {
        panic!("expected ticks");
    };
    let fetched: Vec<Tick> = ticks.iter().map(|tick| tick.tick).collect();
    assert_eq!(fetched, vec![Tick::new(0), Tick::new(1)]);
    let (entry, others) = ticks[1].decode().expect("decode");
    assert!(entry.status.contains_key("alice"));
    assert_eq!(
        entry.status["alice"].visible.position,
        Some(Point::new(2.5, 1.0, 2.5))
    );
    assert_eq!(entry.visibility.map(|seen| seen.players["bob"]), Some(true));
    assert!(others.contains_key("bob"));
    assert!(!others.contains_key("alice"));

    assert_eq!(manager.flush_children().expect("flush"), 0);
    manager.detach_child("alice").expect("detach");
    assert!(matches!(
        manager.detach_child("alice"),
        Err(ObservationError::UnknownChild(_))
    ));
}

fn seed_followed_history(dir: &Path, until: i64) {
    let roster = vec!["alice".to_owned()];
    let mut objective = ObservationRecord::new_objective(PositionMemory::LastSeen);
    let mut alice = ObservationRecord::new_subjective("alice", PositionMemory::LastSeen);
    for tick in 0..=until {
        let status: BTreeMap<String, AgentStatus> =
            [("alice".to_owned(), standing_at(tick as f64))].into_iter().collect();
        objective
            .add_history_objective(
                Tick::new(tick),
                status.clone(),
                Vec::new(),
                Vec::new(),
                None,
                &roster,
            )
            .expect("objective tick");
        alice
            .add_history_subjective(
                Tick::new(tick),
                status,
                Vec::new(),
                BTreeMap::new(),
                None,
                &PosMap::new(),
                &roster,
            )
            .expect("subjective tick");
    }
    let internal = checkpoint::internal_dir(dir);
    fs::create_dir_all(&internal).expect("internal dir");
    let _ = checkpoint::dump_record(&objective, dir, "", Tick::new(until), false).expect("dump");
    let _ = checkpoint::dump_record(
        &alice,
        &internal,
        &checkpoint::agent_prefix("alice"),
        Tick::new(until),
        false,
    )
    .expect("dump alice");
}

fn replicated(tick: i64) -> ReplicatedTick {
    let entry = HistoryEntry {
        status: [("alice".to_owned(), standing_at(tick as f64))]
            .into_iter()
            .collect(),
        visibility: Some(Visibility::default()),
        ..HistoryEntry::default()
    };
    ReplicatedTick::encode(Tick::new(tick), &entry, &BTreeMap::new()).expect("encode")
}

#[tokio::test]
async fn follow_halts_exactly_at_the_stop_tick() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("world[default]").join("alice[follow]");
    seed_followed_history(&dir, 4);

    let (upstream, mut downstream) = replication_channel();
    let manager = ObservationManager::new(
        connected_world(&["alice"]).await,
        settings(10),
        &dir,
        Some(upstream),
    );
    manager.set_agents(agents(&["alice"]));
    manager.load(false).await.expect("load");
    assert_eq!(manager.tick(), Tick::new(4));

    let parent = tokio::spawn(async move {
        let mut answered = false;
        while let Some(request) = downstream.next_request().await {
            match request {
                ChildRequest::Fetch { prev_tick } if !answered => {
                    assert_eq!(prev_tick, Tick::new(4));
                    let ticks = (5..=7).map(replicated).collect();
                    downstream
                        .reply(ParentReply::Fetch(ticks))
                        .expect("child alive");
                    answered = true;
                }
                ChildRequest::Fetch { .. } => {}
                ChildRequest::Cancel => downstream
                    .reply(ParentReply::CancelAck)
                    .expect("child alive"),
            }
        }
    });

    manager.switch_mode(Mode::Follow).expect("mode");
    manager.set_stop_follow_tick(Tick::new(6));
    manager.start().expect("start");
    let dumped = tokio::time::timeout(
        TEST_TIMEOUT,
        manager.dump(DumpOptions {
            end_tick: Some(Tick::new(6)),
            stop: true,
            overwrite: false,
        }),
    )
    .await
    .expect("follow reached the stop tick")
    .expect("dump");

    assert_eq!(dumped, Tick::new(6));
    assert_eq!(manager.tick(), Tick::new(6));
    assert_eq!(manager.follow_queue_len(), 1);
    assert!(!manager.status().active);
    let newest = checkpoint::newest(&dir, "", FileKind::State)
        .expect("list")
        .expect("state written");
    assert_eq!(newest.tick, Tick::new(6));
    let alice = manager.subjective_memory("alice").expect("alice record");
    assert_eq!(
        alice.status["alice"].visible.position,
        Some(Point::new(6.0, 1.0, 2.0))
    );

    manager.close().await.expect("close");
    parent.abort();
}

fn replicated_unseen(tick: i64) -> ReplicatedTick {
    let entry = HistoryEntry {
        status: [("alice".to_owned(), standing_at(tick as f64))]
            .into_iter()
            .collect(),
        visibility: None,
        ..HistoryEntry::default()
    };
    ReplicatedTick::encode(Tick::new(tick), &entry, &BTreeMap::new()).expect("encode")
}

async fn wait_until_inactive(manager: &ObservationManager) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while manager.status().active {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("scheduler stopped");
}

async fn follower_at_tick_four(dir: &Path) -> (ObservationManager, DownstreamPort) {
    seed_followed_history(dir, 4);
    let (upstream, downstream) = replication_channel();
    let manager = ObservationManager::new(
        connected_world(&["alice"]).await,
        settings(10),
        dir,
        Some(upstream),
    );
    manager.set_agents(agents(&["alice"]));
    manager.load(false).await.expect("load");
    manager.switch_mode(Mode::Follow).expect("mode");
    assert_eq!(manager.tick(), Tick::new(4));
    (manager, downstream)
}

#[tokio::test]
async fn dump_rejects_a_stop_tick_behind_the_current_tick() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("world[default]").join("alice[follow]");
    let (manager, _downstream) = follower_at_tick_four(&dir).await;

    manager.set_stop_follow_tick(Tick::new(2));
    let outcome = tokio::time::timeout(
        TEST_TIMEOUT,
        manager.dump(DumpOptions {
            end_tick: Some(Tick::new(2)),
            stop: true,
            overwrite: false,
        }),
    )
    .await
    .expect("dump returned");
    assert!(matches!(
        outcome,
        Err(ObservationError::StopTickPassed { stop, now })
            if stop == Tick::new(2) && now == Tick::new(4)
    ));
    assert_eq!(manager.tick(), Tick::new(4));
}

#[tokio::test]
async fn passed_stop_tick_halts_the_follow_scheduler() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("world[default]").join("alice[follow]");
    let (manager, _downstream) = follower_at_tick_four(&dir).await;

    manager.set_stop_follow_tick(Tick::new(2));
    manager.start().expect("start");
    wait_until_inactive(&manager).await;

    let end = DumpOptions {
        end_tick: Some(Tick::new(2)),
        stop: true,
        overwrite: false,
    };
    let outcome = tokio::time::timeout(TEST_TIMEOUT, manager.dump(end))
        .await
        .expect("dump returned");
    assert!(matches!(
        outcome,
        Err(ObservationError::StopTickPassed { stop, now })
            if stop == Tick::new(2) && now == Tick::new(4)
    ));

    // The failure is reported once; the next dump sees the plain mismatch.
    let outcome = manager.dump(end).await;
    assert!(matches!(
        outcome,
        Err(ObservationError::TickMismatch { expected, actual })
            if expected == Tick::new(2) && actual == Tick::new(4)
    ));
    manager.close().await.expect("close");
}

#[tokio::test]
async fn dump_reports_a_follower_off_its_end_tick() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("world[default]").join("alice[follow]");
    let (manager, _downstream) = follower_at_tick_four(&dir).await;

    let outcome = manager
        .dump(DumpOptions {
            end_tick: Some(Tick::new(6)),
            stop: true,
            overwrite: false,
        })
        .await;
    assert!(matches!(
        outcome,
        Err(ObservationError::TickMismatch { expected, actual })
            if expected == Tick::new(6) && actual == Tick::new(4)
    ));
    assert!(checkpoint::newest(&dir, "", FileKind::State)
        .expect("list")
        .is_some_and(|file| file.tick == Tick::new(4)));
}

#[tokio::test]
async fn ticks_without_visibility_leave_subjective_records_untouched() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("world[default]").join("alice[follow]");
    let (manager, mut downstream) = follower_at_tick_four(&dir).await;

    let parent = tokio::spawn(async move {
        let mut answered = false;
        while let Some(request) = downstream.next_request().await {
            match request {
                ChildRequest::Fetch { .. } if !answered => {
                    let ticks = (5..=6).map(replicated_unseen).collect();
                    downstream
                        .reply(ParentReply::Fetch(ticks))
                        .expect("child alive");
                    answered = true;
                }
                ChildRequest::Fetch { .. } => {}
                ChildRequest::Cancel => downstream
                    .reply(ParentReply::CancelAck)
                    .expect("child alive"),
            }
        }
    });

    manager.set_stop_follow_tick(Tick::new(6));
    manager.start().expect("start");
    wait_until_inactive(&manager).await;

    assert_eq!(manager.tick(), Tick::new(6));
    assert_eq!(
        manager.objective_memory().status["alice"].visible.position,
        Some(Point::new(6.0, 1.0, 2.0))
    );
    let alice = manager.subjective_memory("alice").expect("alice record");
    assert_eq!(
        alice.status["alice"].visible.position,
        Some(Point::new(4.0, 1.0, 2.0))
    );

    manager.close().await.expect("close");
    parent.abort();
}

#[tokio::test]
async fn ticks_with_a_non_finite_position_are_not_recorded() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("world[default]");
    seed_initial_state(&dir, &[]);
    let world = connected_world(&["alice"]).await;
    world
        .move_player("p_alice", Point::new(f64::NAN, 1.0, 12.5))
        .await
        .expect("move");
    let manager = ObservationManager::new(world.clone(), settings(60_000), &dir, None);
    manager.set_agents(agents(&["alice"]));
    manager.load(false).await.expect("load");
    manager.switch_mode(Mode::Observe).expect("mode");

    manager.observe_now().await.expect("tick 0");
    assert_eq!(manager.tick(), Tick::new(0));
    assert!(manager.objective_memory().status.is_empty());

    world
        .move_player("p_alice", Point::new(12.5, 1.0, 12.5))
        .await
        .expect("move");
    manager.observe_now().await.expect("tick 1");
    assert_eq!(manager.tick(), Tick::new(1));
    assert_eq!(
        manager.objective_memory().status["alice"].visible.position,
        Some(Point::new(2.5, 1.0, 2.5))
    );
}

#[tokio::test]
async fn overwrite_keeps_the_memory_patch_when_the_world_refuses() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("world[default]");
    seed_initial_state(&dir, &[]);
    let world = Arc::new(VoxelWorld::new());
    world.fail_placements_at(BlockPos::new(1, 0, 0).offset(OFFSET));
    let manager = ObservationManager::new(world, settings(60_000), &dir, None);
    manager.load(false).await.expect("load");

    let outcome = manager
        .overwrite_state(&[patch([1, 0, 0], "stone")], &[])
        .await;
    assert!(!outcome.success);
    assert!(outcome.error_msg.is_some());
    let memory = manager.objective_memory();
    assert_eq!(
        memory
            .blocks
            .get(BlockPos::new(1, 0, 0))
            .map(|block| block.name.as_str()),
        Some("stone")
    );
}

#[tokio::test]
async fn overwrite_reaches_the_live_world() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("world[default]");
    seed_initial_state(&dir, &[]);
    let world = Arc::new(VoxelWorld::new());
    let manager = ObservationManager::new(world.clone(), settings(60_000), &dir, None);
    manager.load(false).await.expect("load");

    let outcome = manager
        .overwrite_state(&[patch([2, 1, 3], "oak_planks")], &[])
        .await;
    assert!(outcome.success, "{:?}", outcome.error_msg);
    let placed = world.block_at(BlockPos::new(12, 1, 13)).await.expect("placed");
    assert_eq!(placed.name, "oak_planks");
}
