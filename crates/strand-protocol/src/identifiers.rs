//! Peer and stream identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, Result};

/// Identity of a peer in the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a peer id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The role a peer plays in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// A regular overlay node.
    Node,
    /// A topology coordinator.
    Tracker,
    /// A node that persists every message it sees.
    Storage,
}

impl PeerRole {
    /// Returns the wire name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Tracker => "tracker",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerRole {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "node" => Ok(Self::Node),
            "tracker" => Ok(Self::Tracker),
            "storage" => Ok(Self::Storage),
            other => Err(ProtocolError::Malformed(format!("unknown peer role: {other}"))),
        }
    }
}

/// A peer's identity together with its role.
///
/// Exchanged once when a connection is opened and fixed for the lifetime of
/// that connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// The peer's id.
    pub peer_id: PeerId,
    /// The peer's role.
    pub role: PeerRole,
}

impl PeerInfo {
    /// Creates peer info for a regular node.
    #[must_use]
    pub fn node(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            role: PeerRole::Node,
        }
    }

    /// Creates peer info for a tracker.
    #[must_use]
    pub fn tracker(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            role: PeerRole::Tracker,
        }
    }

    /// Creates peer info for a storage node.
    #[must_use]
    pub fn storage(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            role: PeerRole::Storage,
        }
    }

    /// Returns true if the peer takes part in the data plane.
    #[must_use]
    pub fn is_node(&self) -> bool {
        matches!(self.role, PeerRole::Node | PeerRole::Storage)
    }

    /// Returns true if the peer is a tracker.
    #[must_use]
    pub fn is_tracker(&self) -> bool {
        self.role == PeerRole::Tracker
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.role, self.peer_id)
    }
}

/// A partition of a stream; the key every subscription and topology is
/// scoped by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPartition {
    /// The stream id.
    pub stream_id: String,
    /// The partition number within the stream.
    pub partition: u32,
}

impl StreamPartition {
    /// Creates a stream partition key.
    #[must_use]
    pub fn new(stream_id: impl Into<String>, partition: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
        }
    }

    /// Returns the canonical `stream::partition` key.
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StreamPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.stream_id, self.partition)
    }
}

impl FromStr for StreamPartition {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let (stream_id, partition) = s
            .rsplit_once("::")
            .ok_or_else(|| ProtocolError::Malformed(format!("invalid stream partition: {s}")))?;
        if stream_id.is_empty() {
            return Err(ProtocolError::Malformed("empty stream id".into()));
        }
        let partition = partition
            .parse()
            .map_err(|_| ProtocolError::Malformed(format!("invalid partition in {s}")))?;
        Ok(Self::new(stream_id, partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_partition_display_and_parse() {
        let sp = StreamPartition::new("sensors::eu", 3);
        assert_eq!(sp.to_string(), "sensors::eu::3");
        assert_eq!("sensors::eu::3".parse::<StreamPartition>().unwrap(), sp);
    }

    #[test]
    fn stream_partition_parse_rejects_garbage() {
        assert!("no-separator".parse::<StreamPartition>().is_err());
        assert!("::1".parse::<StreamPartition>().is_err());
        assert!("stream::x".parse::<StreamPartition>().is_err());
    }

    #[test]
    fn peer_info_roles() {
        assert!(PeerInfo::node("a").is_node());
        assert!(PeerInfo::storage("s").is_node());
        assert!(!PeerInfo::tracker("t").is_node());
        assert!(PeerInfo::tracker("t").is_tracker());
        assert_eq!("storage".parse::<PeerRole>().unwrap(), PeerRole::Storage);
    }

    #[test]
    fn peer_info_serializes_camel_case() {
        let json = serde_json::to_value(PeerInfo::node("n1")).unwrap();
        assert_eq!(json, serde_json::json!({"peerId": "n1", "role": "node"}));
    }
}
