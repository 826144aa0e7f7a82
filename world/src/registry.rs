use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use belief_nest_core::BeliefPath;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::{GameWorld, WorldError};

/// Network address of a game server.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorldAddress {
    /// Host name.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl WorldAddress {
    /// Creates an address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for WorldAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens connections to game servers.
#[async_trait]
pub trait WorldConnector: Send + Sync {
    /// Connects to the server at the address.
    async fn connect(&self, address: &WorldAddress) -> Result<Arc<dyn GameWorld>, WorldError>;
}

struct Connection {
    world: Arc<dyn GameWorld>,
    holders: BTreeSet<BeliefPath>,
}

/// One shared connection per address, released with its last holder.
pub struct ConnectionRegistry {
    connector: Arc<dyn WorldConnector>,
    connections: Mutex<BTreeMap<WorldAddress, Connection>>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry").finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Creates a registry opening connections through the connector.
    #[must_use]
    pub fn new(connector: Arc<dyn WorldConnector>) -> Self {
        Self {
            connector,
            connections: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the shared connection for the address, opening it on first use.
    pub async fn acquire(
        &self,
        address: &WorldAddress,
        belief_path: &BeliefPath,
    ) -> Result<Arc<dyn GameWorld>, WorldError> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get_mut(address) {
            if !connection.holders.insert(belief_path.clone()) {
                return Err(WorldError::DuplicateRegistration {
                    address: address.to_string(),
                    belief_path: belief_path.to_string(),
                });
            }
            return Ok(Arc::clone(&connection.world));
        }
        let world = self.connector.connect(address).await?;
        info!(%address, %belief_path, "opened world connection");
        let _ = connections.insert(
            address.clone(),
            Connection {
                world: Arc::clone(&world),
                holders: [belief_path.clone()].into_iter().collect(),
            },
        );
        Ok(world)
    }

    /// Releases a holder, closing the connection when none remain.
    pub async fn release(
        &self,
        address: &WorldAddress,
        belief_path: &BeliefPath,
    ) -> Result<(), WorldError> {
        let mut connections = self.connections.lock().await;
        let unknown = || WorldError::UnknownRegistration {
            address: address.to_string(),
            belief_path: belief_path.to_string(),
        };
        let connection = connections.get_mut(address).ok_or_else(unknown)?;
        if !connection.holders.remove(belief_path) {
            return Err(unknown());
        }
        if connection.holders.is_empty() {
            if let Some(closed) = connections.remove(address) {
                closed.world.shutdown().await;
                info!(%address, "closed world connection");
            }
        }
        Ok(())
    }

    /// Belief worlds currently holding the address.
    pub async fn holders(&self, address: &WorldAddress) -> Vec<BeliefPath> {
        self.connections
            .lock()
            .await
            .get(address)
            .map(|connection| connection.holders.iter().cloned().collect())
            .unwrap_or_default()
    }
}
