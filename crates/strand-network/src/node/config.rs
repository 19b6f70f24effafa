//! Node configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strand_protocol::{PeerId, PeerInfo, PeerRole};

use crate::endpoint::EndpointConfig;
use crate::{NetworkError, Result};

/// Configuration of an overlay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity; the role is `node` or `storage`.
    pub peer_info: PeerInfo,
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// URLs other nodes dial to reach this node, best first. Empty means
    /// the bound address.
    pub advertised_urls: Vec<String>,
    /// Tracker URLs.
    pub trackers: Vec<String>,
    /// Peers able to serve resends from persistent storage.
    pub storage_peers: Vec<PeerId>,
    /// Upper bound on neighbors per partition.
    pub max_neighbors_per_node: usize,
    /// Interval between status reports.
    pub status_interval: Duration,
    /// Interval between reconnect and re-signalling attempts.
    pub retry_interval: Duration,
    /// How long a signalling attempt may take before it is discarded.
    pub rtc_handshake_timeout: Duration,
    /// Interval between transport pings.
    pub ping_interval: Duration,
    /// Bound on dialing and on the WebSocket upgrade.
    pub connect_timeout: Duration,
    /// Seen-cache entries per partition.
    pub seen_cache_size: usize,
    /// Age after which a seen entry expires.
    pub seen_cache_ttl: Duration,
    /// Publishers per partition whose last delivered message is tracked
    /// for gap detection.
    pub max_tracked_publishers: usize,
    /// How long a resend this node requested may go without a response
    /// before it is failed.
    pub resend_timeout: Duration,
    /// Messages kept per partition for serving resends.
    pub buffer_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_info: PeerInfo::node(format!("node-{:08x}", rand::random::<u32>())),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertised_urls: Vec::new(),
            trackers: Vec::new(),
            storage_peers: Vec::new(),
            max_neighbors_per_node: 4,
            status_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(2),
            rtc_handshake_timeout: Duration::from_secs(15),
            ping_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            seen_cache_size: 10_000,
            seen_cache_ttl: Duration::from_secs(300),
            max_tracked_publishers: 1_000,
            resend_timeout: Duration::from_secs(30),
            buffer_size: 10_000,
        }
    }
}

/// Upper bound on every configured interval.
const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

fn is_ws_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

impl NodeConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.peer_info.peer_id.as_str().is_empty() {
            return Err(NetworkError::Config("node id must not be empty".into()));
        }
        if self.peer_info.role == PeerRole::Tracker {
            return Err(NetworkError::Config("a node cannot have the tracker role".into()));
        }
        if self.max_neighbors_per_node == 0 {
            return Err(NetworkError::Config(
                "max_neighbors_per_node must be at least 1".into(),
            ));
        }
        for (name, interval) in [
            ("status_interval", self.status_interval),
            ("retry_interval", self.retry_interval),
            ("ping_interval", self.ping_interval),
            ("rtc_handshake_timeout", self.rtc_handshake_timeout),
            ("resend_timeout", self.resend_timeout),
        ] {
            if interval.is_zero() {
                return Err(NetworkError::Config(format!("{name} must be positive")));
            }
            if interval > MAX_INTERVAL {
                return Err(NetworkError::Config(format!("{name} must be at most a day")));
            }
        }
        if let Some(url) = self
            .trackers
            .iter()
            .chain(&self.advertised_urls)
            .find(|url| !is_ws_url(url))
        {
            return Err(NetworkError::Config(format!("not a WebSocket URL: {url}")));
        }
        Ok(())
    }

    /// Returns the URLs to advertise once bound to `local_addr`.
    #[must_use]
    pub fn advertised(&self, local_addr: SocketAddr) -> Vec<String> {
        if !self.advertised_urls.is_empty() {
            return self.advertised_urls.clone();
        }
        let mut addr = local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip([127, 0, 0, 1].into());
        }
        vec![format!("ws://{addr}")]
    }

    pub(crate) fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            peer_info: self.peer_info.clone(),
            listen_addr: self.listen_addr,
            ping_interval: self.ping_interval,
            connect_timeout: self.connect_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_tracker_role() {
        let config = NodeConfig {
            peer_info: PeerInfo::tracker("t"),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(NetworkError::Config(_))));
    }

    #[test]
    fn rejects_huge_intervals() {
        let config = NodeConfig {
            retry_interval: Duration::from_secs(u64::MAX),
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("retry_interval"));
    }

    #[test]
    fn rejects_http_tracker() {
        let config = NodeConfig {
            trackers: vec!["http://tracker:27777".into()],
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("http://tracker:27777"));
    }

    #[test]
    fn advertises_loopback_for_wildcard() {
        let config = NodeConfig::default();
        let bound: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(config.advertised(bound), vec!["ws://127.0.0.1:4000".to_string()]);

        let config = NodeConfig {
            advertised_urls: vec!["wss://node.example:443".into()],
            ..Default::default()
        };
        assert_eq!(config.advertised(bound), vec!["wss://node.example:443".to_string()]);
    }
}
