//! Typed views of the wire protocols.
//!
//! Each facade wraps a [`PeerDirectory`](crate::directory::PeerDirectory)
//! and offers one send method per message a role may emit. The matching
//! `classify` function turns a decoded [`Message`](strand_protocol::Message)
//! into the events that role handles, and rejects messages of the other
//! layer.

pub mod node_to_node;
pub mod tracker_node;
pub mod tracker_server;
