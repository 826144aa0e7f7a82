use std::{path::Path, sync::Arc, time::Duration};

use belief_nest_core::{BeliefPath, BlockPatch, BlockPos, Point, Tick};
use belief_nest_hierarchy::{
    AgentKind, BeliefNest, ChildOptions, HierarchyError, JoinOptions, WorldConfig,
};
use belief_nest_system_observation::{checkpoint, ObservationConfig};
use belief_nest_system_record::{ObservationRecord, PositionMemory};
use belief_nest_world::{query, GameWorld, VoxelConnector, VoxelWorld};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn config(ckpt_dir: &Path) -> WorldConfig {
    WorldConfig {
        ckpt_dir: ckpt_dir.to_path_buf(),
        env_box: [[0, 0, 0], [15, 15, 15]],
        worker_ready_timeout_ms: 2_000,
        observation: ObservationConfig {
            tick_period_ms: 60_000,
            follow_period_ms: 20,
            flush_period_ms: 20,
            progress_log_period_ms: 100,
            ..ObservationConfig::default()
        },
        ..WorldConfig::default()
    }
}

fn seed_root(ckpt_dir: &Path) {
    let dir = ckpt_dir.join("world[default]");
    std::fs::create_dir_all(&dir).expect("branch dir");
    let mut record = ObservationRecord::new_objective(PositionMemory::LastSeen);
    let patch = |position, name: &str| BlockPatch {
        position,
        name: Some(name.to_owned()),
        properties: None,
    };
    record.overwrite_state(&[patch([0, 0, 0], "bedrock"), patch([1, 0, 0], "stone")], &[]);
    checkpoint::dump_initial_state(&record, &dir, "").expect("initial state");
}

async fn open(ckpt_dir: &Path) -> (Arc<VoxelWorld>, BeliefNest) {
    let world = Arc::new(VoxelWorld::new());
    let nest = BeliefNest::open(
        config(ckpt_dir),
        Arc::new(VoxelConnector::shared(Arc::clone(&world))),
    )
    .await
    .expect("root world");
    (world, nest)
}

fn alice_world() -> BeliefPath {
    BeliefPath::root().child("alice")
}

fn child_options(start_follow: bool) -> ChildOptions {
    ChildOptions {
        offset: BlockPos::new(100, 0, 0),
        player_prefix: "a_".to_owned(),
        address: WorldConfig::default().address(),
        start_follow,
    }
}

/// Root world with alice and bob, loaded from its initial state, and a
/// following child world under alice. The root has observed ticks 1 and 2.
async fn observed_tree(ckpt_dir: &Path) -> (Arc<VoxelWorld>, BeliefNest) {
    seed_root(ckpt_dir);
    let (world, mut nest) = open(ckpt_dir).await;
    let root = BeliefPath::root();
    nest.join(&root, JoinOptions::bot("alice").at(Point::new(2.5, 1.0, 2.5)))
        .await
        .expect("alice joins");
    nest.join(&root, JoinOptions::bot("bob").at(Point::new(4.5, 1.0, 2.5)))
        .await
        .expect("bob joins");
    nest.load_observation(&root, false).await.expect("root loaded");
    nest.create_child_sim(&root, "alice", child_options(true))
        .await
        .expect("child world");

    nest.start_observation(&root).expect("observing");
    let manager = nest.root().manager();
    manager.observe_now().await.expect("tick 1");
    manager.observe_now().await.expect("tick 2");
    assert_eq!(manager.tick(), Tick::new(2));
    (world, nest)
}

#[tokio::test]
async fn joining_enforces_name_rules() {
    let ckpt = tempfile::tempdir().expect("tempdir");
    let (world, mut nest) = open(ckpt.path()).await;
    let root = BeliefPath::root();

    for reserved in ["operator", "world", "admin"] {
        assert!(matches!(
            nest.join(&root, JoinOptions::bot(reserved)).await,
            Err(HierarchyError::ReservedName(_))
        ));
    }
    assert!(matches!(
        nest.join(&root, JoinOptions::bot("al ice")).await,
        Err(HierarchyError::Core(_))
    ));
    assert!(matches!(
        nest.join(&root, JoinOptions::bot("a_very_long_agent_name")).await,
        Err(HierarchyError::NameTooLong { limit: 16, .. })
    ));

    nest.join(&root, JoinOptions::bot("alice"))
        .await
        .expect("alice joins");
    assert!(matches!(
        nest.join(&root, JoinOptions::bot("alice")).await,
        Err(HierarchyError::DuplicateName(_))
    ));
    assert!(matches!(
        nest.join(&root, JoinOptions::human("carol")).await,
        Err(HierarchyError::HumanNotConnected(_))
    ));

    world.connect_player("dave").await.expect("dave connects");
    nest.join(&root, JoinOptions::human("dave"))
        .await
        .expect("dave joins");
    let dave = nest.root().player("dave").expect("dave");
    assert_eq!(dave.kind(), AgentKind::Human);
    assert!(matches!(
        nest.execute(&root, "dave", "chat hi").await,
        Err(HierarchyError::HumanControlled(_))
    ));

    let outcome = nest
        .execute(&root, "alice", "chat hello")
        .await
        .expect("program ran");
    assert!(outcome.success);
    assert_eq!(query::is_transparent(&world, "admin"), Some(true));
    assert_eq!(query::is_transparent(&world, "alice"), Some(false));

    nest.close().await.expect("closed");
    let remaining = world.player_names().await;
    assert_eq!(remaining, vec!["dave".to_owned()]);
}

#[tokio::test]
async fn only_the_admin_reshapes_the_world() {
    let ckpt = tempfile::tempdir().expect("tempdir");
    let (_world, mut nest) = open(ckpt.path()).await;
    let root = BeliefPath::root();
    nest.join(&root, JoinOptions::bot("alice"))
        .await
        .expect("alice joins");

    let alice = nest.root().player("alice").expect("alice");
    assert!(matches!(
        alice.set_transparency("alice", true).await,
        Err(HierarchyError::NotAdmin { .. })
    ));
    nest.root()
        .admin()
        .set_transparency("alice", true)
        .await
        .expect("admin may hide agents");
    nest.close().await.expect("closed");
}

#[tokio::test]
async fn humans_stay_in_the_root_world() {
    let ckpt = tempfile::tempdir().expect("tempdir");
    let (world, mut nest) = observed_tree(ckpt.path()).await;
    world.connect_player("a_dave").await.expect("dave connects");
    assert!(matches!(
        nest.join(&alice_world(), JoinOptions::human("dave")).await,
        Err(HierarchyError::HumanOnlyInRoot(_))
    ));
    nest.close().await.expect("closed");
}

#[tokio::test]
async fn child_worlds_replay_and_dump_with_their_parent() {
    let ckpt = tempfile::tempdir().expect("tempdir");
    let (world, nest) = observed_tree(ckpt.path()).await;

    let child = nest.world(&alice_world()).expect("child world");
    assert_eq!(child.agent_names(), vec!["alice".to_owned(), "bob".to_owned()]);
    assert_eq!(child.player("bob").expect("shadow").game_name(), "a_bob");

    let tick = tokio::time::timeout(
        TEST_TIMEOUT,
        nest.dump_observation(BeliefPath::root(), true, false),
    )
    .await
    .expect("dump finished in time")
    .expect("dumped");
    assert_eq!(tick, Tick::new(2));

    let root_dir = ckpt.path().join("world[default]");
    let child_dir = root_dir.join("alice[follow]");
    assert!(root_dir.join("state#2.json").is_file());
    assert!(child_dir.join("state#-1.json").is_file());
    assert!(child_dir.join("state#2.json").is_file());
    assert!(checkpoint::internal_dir(&child_dir)
        .join("alice#state#2.json")
        .is_file());

    let status = nest.sim_status(&BeliefPath::root()).expect("status");
    assert_eq!(status.branch_label, "default");
    assert_eq!(status.mode.as_deref(), Some("observe"));
    assert!(status.active);
    let child_status = &status.children["alice"];
    assert_eq!(child_status.branch_label, "follow");
    assert_eq!(child_status.mode.as_deref(), Some("follow"));
    assert_eq!(child_status.tick, Tick::new(2));

    let shadow = world.sample_player("a_alice").await.expect("shadow connected");
    assert!(shadow.position.distance(Point::new(102.5, 1.0, 2.5)) < 1e-6);

    nest.close().await.expect("closed");
    assert!(world.player_names().await.is_empty());
}

#[tokio::test]
async fn switching_branch_copies_checkpoints_and_restarts_follow() {
    let ckpt = tempfile::tempdir().expect("tempdir");
    let (_world, mut nest) = observed_tree(ckpt.path()).await;
    let root = BeliefPath::root();

    tokio::time::timeout(TEST_TIMEOUT, nest.switch_branch(&root, "what_if"))
        .await
        .expect("switch finished in time")
        .expect("switched");

    let branch_dir = ckpt.path().join("world[what_if]");
    assert!(branch_dir.join("state#2.json").is_file());
    assert!(branch_dir.join("alice[follow]").join("state#2.json").is_file());
    assert!(ckpt.path().join("world[default]").join("state#2.json").is_file());

    let status = nest.sim_status(&root).expect("status");
    assert_eq!(status.branch_label, "what_if");
    assert_eq!(status.mode.as_deref(), Some("observe"));
    assert!(!status.active);
    assert_eq!(status.tick, Tick::new(2));
    let child_status = &status.children["alice"];
    assert_eq!(child_status.mode.as_deref(), Some("follow"));
    assert!(child_status.active);
    assert_eq!(
        nest.world(&alice_world()).expect("child").branch().to_string(),
        "what_if/follow"
    );
    nest.close().await.expect("closed");
}

#[tokio::test]
async fn leaving_and_removing_close_child_worlds() {
    let ckpt = tempfile::tempdir().expect("tempdir");
    let (world, mut nest) = observed_tree(ckpt.path()).await;
    let root = BeliefPath::root();
    let address = WorldConfig::default().address();
    assert_eq!(nest.registry().holders(&address).await.len(), 2);

    nest.remove_child_sim(&alice_world())
        .await
        .expect("child removed");
    assert!(matches!(
        nest.world(&alice_world()),
        Err(HierarchyError::NoChildWorld(_))
    ));
    assert_eq!(nest.registry().holders(&address).await, vec![root.clone()]);
    assert!(world.sample_player("a_alice").await.is_none());

    nest.create_child_sim(&root, "alice", child_options(false))
        .await
        .expect("child created again");
    let child_status = &nest.sim_status(&root).expect("status").children["alice"];
    assert_eq!(child_status.mode, None);

    nest.leave(&root, "alice").await.expect("alice left");
    assert!(matches!(
        nest.world(&alice_world()),
        Err(HierarchyError::AgentNotFound(_))
    ));
    assert_eq!(nest.registry().holders(&address).await, vec![root]);
    assert_eq!(nest.root().agent_names(), vec!["bob".to_owned()]);
    nest.close().await.expect("closed");
}
