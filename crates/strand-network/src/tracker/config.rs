//! Tracker configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strand_protocol::{PeerId, PeerInfo};

use crate::endpoint::EndpointConfig;
use crate::{NetworkError, Result};

/// Default tracker port.
pub const DEFAULT_TRACKER_PORT: u16 = 27777;

/// Configuration of a tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Tracker id announced to nodes.
    pub peer_id: PeerId,
    /// Human readable name, used in logs.
    pub name: String,
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Upper bound on the neighbors assigned to a node per partition.
    pub max_neighbors_per_node: usize,
    /// Interval between transport pings.
    pub ping_interval: Duration,
    /// Bound on the WebSocket upgrade.
    pub connect_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            peer_id: PeerId::new(format!("tracker-{DEFAULT_TRACKER_PORT}")),
            name: format!("tracker-{DEFAULT_TRACKER_PORT}"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_TRACKER_PORT)),
            max_neighbors_per_node: 4,
            ping_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TrackerConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.peer_id.as_str().is_empty() {
            return Err(NetworkError::Config("tracker id must not be empty".into()));
        }
        if self.max_neighbors_per_node == 0 {
            return Err(NetworkError::Config(
                "max_neighbors_per_node must be at least 1".into(),
            ));
        }
        if self.ping_interval.is_zero() {
            return Err(NetworkError::Config("ping_interval must be positive".into()));
        }
        Ok(())
    }

    pub(crate) fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            peer_info: PeerInfo::tracker(self.peer_id.clone()),
            listen_addr: self.listen_addr,
            ping_interval: self.ping_interval,
            connect_timeout: self.connect_timeout,
        }
    }
}
