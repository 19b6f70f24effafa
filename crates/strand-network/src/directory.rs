//! Peer directory.
//!
//! Maps peer ids to their address, role and live connection. A directory is
//! owned by exactly one event loop and is never shared.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use strand_protocol::{Message, PeerId, PeerInfo, PeerRole};
use tracing::debug;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::{NetworkError, Result};

/// A connected peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Identity announced at handshake.
    pub info: PeerInfo,
    /// Dialed URL or remote socket address.
    pub address: String,
    /// True if the local side dialed.
    pub outbound: bool,
    /// Sending side of the connection.
    pub handle: ConnectionHandle,
    /// When the connection was registered.
    pub connected_at: Instant,
}

/// Outcome of [`PeerDirectory::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First connection to the peer.
    New,
    /// The new connection superseded an existing one, which was closed.
    Replaced,
    /// An existing connection was kept; the new one was closed.
    Duplicate,
}

/// The local view of connected peers.
#[derive(Debug)]
pub struct PeerDirectory {
    local: PeerId,
    peers: HashMap<PeerId, PeerEntry>,
    addresses: HashMap<String, PeerId>,
}

impl PeerDirectory {
    /// Creates an empty directory for the local peer `local`.
    #[must_use]
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            addresses: HashMap::new(),
        }
    }

    /// Registers a freshly established connection.
    ///
    /// When two connections to the same peer exist, both sides must keep
    /// the same one. A reconnect by the same initiator supersedes the old
    /// connection; otherwise the connection initiated by the smaller peer id
    /// wins.
    pub fn register(
        &mut self,
        info: PeerInfo,
        address: String,
        outbound: bool,
        handle: ConnectionHandle,
    ) -> Registration {
        let mut outcome = Registration::New;
        if let Some(existing) = self.peers.get(&info.peer_id) {
            if !existing.handle.is_closed() {
                let existing_initiator = self.initiator(existing.outbound, &info.peer_id);
                let new_initiator = self.initiator(outbound, &info.peer_id);
                if existing_initiator != new_initiator && existing_initiator < new_initiator {
                    debug!(peer = %info, "Keeping existing connection");
                    handle.close();
                    return Registration::Duplicate;
                }
                existing.handle.close();
            }
            if let Some(old) = self.peers.remove(&info.peer_id) {
                self.addresses.remove(&old.address);
            }
            outcome = Registration::Replaced;
        }

        self.addresses.insert(address.clone(), info.peer_id.clone());
        self.peers.insert(
            info.peer_id.clone(),
            PeerEntry {
                info,
                address,
                outbound,
                handle,
                connected_at: Instant::now(),
            },
        );
        outcome
    }

    fn initiator<'a>(&'a self, outbound: bool, remote: &'a PeerId) -> &'a PeerId {
        if outbound {
            &self.local
        } else {
            remote
        }
    }

    /// Returns the address of a connected peer.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::PeerNotFound`] if the peer is not connected.
    pub fn address_of(&self, peer_id: &PeerId) -> Result<&str> {
        self.peers
            .get(peer_id)
            .map(|entry| entry.address.as_str())
            .ok_or_else(|| NetworkError::PeerNotFound(peer_id.to_string()))
    }

    /// Returns the peer connected at `address`.
    #[must_use]
    pub fn peer_id_of(&self, address: &str) -> Option<&PeerId> {
        self.addresses.get(address)
    }

    /// Removes a peer regardless of which connection it is on.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerEntry> {
        let entry = self.peers.remove(peer_id)?;
        self.addresses.remove(&entry.address);
        Some(entry)
    }

    /// Removes a peer only if `connection_id` is its current connection.
    pub fn remove_connection(
        &mut self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
    ) -> Option<PeerEntry> {
        if self.peers.get(peer_id)?.handle.id() != connection_id {
            return None;
        }
        self.remove(peer_id)
    }

    /// Returns true if the peer is connected with the given role.
    #[must_use]
    pub fn is_role(&self, peer_id: &PeerId, role: PeerRole) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|entry| entry.info.role == role)
    }

    /// Returns every connected peer.
    #[must_use]
    pub fn all(&self) -> Vec<PeerInfo> {
        self.peers.values().map(|entry| entry.info.clone()).collect()
    }

    /// Returns a connected peer's entry.
    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }

    /// Returns a connected peer's handle.
    #[must_use]
    pub fn handle(&self, peer_id: &PeerId) -> Option<&ConnectionHandle> {
        self.peers.get(peer_id).map(|entry| &entry.handle)
    }

    /// Encodes and sends a message to a connected peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is unknown, its connection is gone, or
    /// the message cannot be encoded.
    pub fn send(&self, peer_id: &PeerId, message: &Message) -> Result<()> {
        self.handle(peer_id)
            .ok_or_else(|| NetworkError::PeerNotFound(peer_id.to_string()))?
            .send(message)
    }

    /// Returns the ids of connected peers with `role`.
    #[must_use]
    pub fn peers_with_role(&self, role: PeerRole) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|entry| entry.info.role == role)
            .map(|entry| entry.info.peer_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Returns measured round-trip times to data-plane peers.
    #[must_use]
    pub fn rtts(&self) -> BTreeMap<PeerId, u64> {
        self.peers
            .values()
            .filter(|entry| entry.info.is_node())
            .filter_map(|entry| Some((entry.info.peer_id.clone(), entry.handle.rtt()?)))
            .collect()
    }

    /// Returns true if the peer is connected.
    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Returns the number of connected peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if no peer is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Closes and forgets every connection.
    pub fn clear(&mut self) {
        for entry in self.peers.values() {
            entry.handle.close();
        }
        self.peers.clear();
        self.addresses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> PeerDirectory {
        PeerDirectory::new(PeerId::new("local"))
    }

    #[test]
    fn register_and_lookup() {
        let mut dir = directory();
        let (handle, _rx) = ConnectionHandle::channel();
        let outcome = dir.register(PeerInfo::node("a"), "ws://a".into(), true, handle);
        assert_eq!(outcome, Registration::New);

        assert_eq!(dir.address_of(&PeerId::new("a")).unwrap(), "ws://a");
        assert_eq!(dir.peer_id_of("ws://a"), Some(&PeerId::new("a")));
        assert!(dir.is_role(&PeerId::new("a"), PeerRole::Node));
        assert!(!dir.is_role(&PeerId::new("a"), PeerRole::Tracker));
        assert_eq!(dir.all(), vec![PeerInfo::node("a")]);
        assert!(matches!(
            dir.address_of(&PeerId::new("b")),
            Err(NetworkError::PeerNotFound(_))
        ));
    }

    #[test]
    fn stale_disconnect_does_not_evict_newer_connection() {
        let mut dir = directory();
        let (old, _old_rx) = ConnectionHandle::channel();
        let old_id = old.id();
        dir.register(PeerInfo::node("a"), "ws://a".into(), true, old);

        let (new, _new_rx) = ConnectionHandle::channel();
        let new_id = new.id();
        assert_eq!(
            dir.register(PeerInfo::node("a"), "ws://a".into(), true, new),
            Registration::Replaced
        );

        assert!(dir.remove_connection(&PeerId::new("a"), old_id).is_none());
        assert!(dir.contains(&PeerId::new("a")));
        assert!(dir.remove_connection(&PeerId::new("a"), new_id).is_some());
        assert!(dir.is_empty());
        assert_eq!(dir.peer_id_of("ws://a"), None);
    }

    #[test]
    fn crossed_connections_keep_smaller_initiator() {
        // "local" < "zed": the connection local dialed wins on both sides
        let mut dir = directory();
        let (ours, _ours_rx) = ConnectionHandle::channel();
        dir.register(PeerInfo::node("zed"), "ws://zed".into(), true, ours);

        let (theirs, mut theirs_rx) = ConnectionHandle::channel();
        assert_eq!(
            dir.register(PeerInfo::node("zed"), "ws://10.0.0.1:5".into(), false, theirs),
            Registration::Duplicate
        );
        assert!(matches!(
            theirs_rx.try_recv(),
            Ok(crate::connection::Outbound::Close)
        ));
        assert_eq!(dir.address_of(&PeerId::new("zed")).unwrap(), "ws://zed");

        // "alpha" < "local": the connection alpha dialed wins
        let (ours, mut ours_rx) = ConnectionHandle::channel();
        dir.register(PeerInfo::node("alpha"), "ws://alpha".into(), true, ours);
        let (theirs, _theirs_rx) = ConnectionHandle::channel();
        assert_eq!(
            dir.register(PeerInfo::node("alpha"), "ws://10.0.0.2:5".into(), false, theirs),
            Registration::Replaced
        );
        assert!(matches!(
            ours_rx.try_recv(),
            Ok(crate::connection::Outbound::Close)
        ));
    }

    #[test]
    fn send_and_rtts() {
        let mut dir = directory();
        let (handle, mut rx) = ConnectionHandle::channel();
        dir.register(PeerInfo::tracker("t"), "ws://t".into(), true, handle);
        let msg = Message::Subscribe(strand_protocol::SubscribeRequest {
            request_id: "r".into(),
            stream_partition: strand_protocol::StreamPartition::new("s", 0),
        });
        dir.send(&PeerId::new("t"), &msg).unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(dir.send(&PeerId::new("nobody"), &msg).is_err());
        assert!(dir.rtts().is_empty());
        assert_eq!(dir.peers_with_role(PeerRole::Tracker), vec![PeerId::new("t")]);
    }

    #[test]
    fn clear_closes_everything() {
        let mut dir = directory();
        let (handle, mut rx) = ConnectionHandle::channel();
        dir.register(PeerInfo::node("a"), "ws://a".into(), false, handle);
        dir.clear();
        assert!(dir.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Ok(crate::connection::Outbound::Close)
        ));
    }
}
