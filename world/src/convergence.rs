use std::time::Duration;

use belief_nest_core::{BlockUpdate, Point};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::{GameWorld, WorldError};

/// Interval between two convergence checks.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

const HORIZONTAL_TOLERANCE: f64 = 1.0;
const VERTICAL_TOLERANCE: f64 = 3.0;

/// How long to wait for a world mutation and what to do on expiry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Deadline measured from the mutation.
    pub timeout: Duration,
    /// Resolve instead of failing when the deadline passes.
    pub tolerant: bool,
}

impl WaitPolicy {
    /// Fails when the deadline passes.
    #[must_use]
    pub const fn strict(timeout: Duration) -> Self {
        Self {
            timeout,
            tolerant: false,
        }
    }

    /// Resolves anyway when the deadline passes.
    #[must_use]
    pub const fn tolerant(timeout: Duration) -> Self {
        Self {
            timeout,
            tolerant: true,
        }
    }

    fn expire(&self, what: String, waited: Duration) -> Result<(), WorldError> {
        if self.tolerant {
            debug!(%what, ?waited, "giving up waiting");
            Ok(())
        } else {
            Err(WorldError::Timeout { what, waited })
        }
    }
}

fn arrived(at: Point, target: Point) -> bool {
    let dx = at.x() - target.x();
    let dz = at.z() - target.z();
    (dx * dx + dz * dz).sqrt() <= HORIZONTAL_TOLERANCE
        && (at.y() - target.y()).abs() <= VERTICAL_TOLERANCE
}

/// Moves a player and waits until its reported position reaches the target.
pub async fn teleport_and_wait(
    world: &dyn GameWorld,
    game_name: &str,
    target: Point,
    policy: WaitPolicy,
) -> Result<(), WorldError> {
    world.move_player(game_name, target).await?;
    let started = Instant::now();
    loop {
        match world.sample_player(game_name).await {
            Some(sample) if arrived(sample.position, target) => return Ok(()),
            Some(_) => {}
            None => return Err(WorldError::UnknownPlayer(game_name.to_owned())),
        }
        let waited = started.elapsed();
        if waited >= policy.timeout {
            if !policy.tolerant {
                warn!(player = game_name, ?target, "teleport did not converge");
            }
            return policy.expire(format!("{game_name} to reach {target:?}"), waited);
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Places blocks and waits until the world reports every one of them.
pub async fn place_and_confirm(
    world: &dyn GameWorld,
    updates: &[BlockUpdate],
    policy: WaitPolicy,
) -> Result<(), WorldError> {
    if updates.is_empty() {
        return Ok(());
    }
    world.set_blocks(updates).await?;
    let started = Instant::now();
    let mut pending: Vec<&BlockUpdate> = updates.iter().collect();
    loop {
        let mut still_pending = Vec::with_capacity(pending.len());
        for update in pending {
            let placed = world.block_at(update.position).await;
            let matches = match placed {
                Some(block) => block.name == update.block.name,
                None => world.catalog().is_non_colliding(&update.block.name),
            };
            if !matches {
                still_pending.push(update);
            }
        }
        pending = still_pending;
        if pending.is_empty() {
            return Ok(());
        }
        let waited = started.elapsed();
        if waited >= policy.timeout {
            return policy.expire(format!("{} block placements", pending.len()), waited);
        }
        sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{arrived, place_and_confirm, teleport_and_wait, WaitPolicy};
    use crate::{GameWorld, VoxelWorld, WorldError};
    use belief_nest_core::{Block, BlockPos, BlockUpdate, Point};

    #[test]
    fn arrival_tolerates_vertical_drift() {
        let target = Point::new(0.0, 10.0, 0.0);
        assert!(arrived(Point::new(0.5, 7.5, 0.5), target));
        assert!(!arrived(Point::new(1.0, 10.0, 1.0), target));
    }

    #[tokio::test]
    async fn teleport_of_a_pinned_player_times_out() {
        let world = VoxelWorld::new();
        world.connect_player("p_alice").await.expect("connect");
        world.pin_player("p_alice");
        let result = teleport_and_wait(
            &world,
            "p_alice",
            Point::new(5.0, 0.0, 5.0),
            WaitPolicy::strict(Duration::from_millis(60)),
        )
        .await;
        assert!(matches!(result, Err(WorldError::Timeout { .. })));

        let tolerant = teleport_and_wait(
            &world,
            "p_alice",
            Point::new(5.0, 0.0, 5.0),
            WaitPolicy::tolerant(Duration::from_millis(60)),
        )
        .await;
        assert_eq!(tolerant, Ok(()));
    }

    #[tokio::test]
    async fn placements_are_confirmed() {
        let world = VoxelWorld::new();
        let updates = vec![BlockUpdate::new(BlockPos::new(1, 0, 1), Block::named("stone"))];
        place_and_confirm(&world, &updates, WaitPolicy::strict(Duration::from_millis(100)))
            .await
            .expect("placed");
        assert_eq!(
            world.block_at(BlockPos::new(1, 0, 1)).await.map(|block| block.name),
            Some("stone".to_owned())
        );
    }
}
