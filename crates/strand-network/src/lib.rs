//! # Strand Network
//!
//! Tracker coordination and the overlay node for the Strand stream network.
//!
//! Nodes subscribe to stream partitions and report them to a tracker. The
//! tracker keeps a bounded, connected neighbor graph per partition and tells
//! each node whom to connect to. Nodes find each other through handshakes
//! the tracker relays, then propagate data messages along the graph and
//! answer resend requests for recent history.
//!
//! ```no_run
//! use strand_network::{start_tracker, NetworkNode, NodeConfig, TrackerConfig};
//! use strand_protocol::StreamPartition;
//!
//! # async fn run() -> strand_network::Result<()> {
//! let tracker = start_tracker(TrackerConfig::default()).await?;
//! let node = NetworkNode::start(
//!     NodeConfig {
//!         trackers: vec![tracker.url()],
//!         ..Default::default()
//!     },
//!     None,
//! )
//! .await?;
//! node.subscribe(StreamPartition::new("stream-1", 0))?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod directory;
pub mod endpoint;
mod error;
pub mod metrics;
pub mod node;
pub mod protocol;
pub mod retry;
pub mod scheduler;
pub mod seen;
pub mod tracker;

pub use error::{NetworkError, Result};
pub use metrics::{NodeMetrics, TrackerMetrics};
pub use node::{NetworkNode, NodeConfig, NodeSnapshot, ResendEvent, SubscriptionState};
pub use tracker::{start_tracker, RunningTracker, TrackerConfig, TrackerSnapshot};
