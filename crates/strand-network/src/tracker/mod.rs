//! Tracker: topology coordination and signalling relay.
//!
//! A tracker accepts node connections, collects their status reports,
//! assigns neighbors per partition and relays signalling between nodes.
//! All state lives in one [`Coordinator`] driven by a single task;
//! [`RunningTracker`] is the handle to that task.

mod config;
mod coordinator;
pub mod topology;

pub use config::{TrackerConfig, DEFAULT_TRACKER_PORT};
pub use coordinator::{Coordinator, NodeView, TrackerSnapshot};

use std::net::SocketAddr;

use strand_protocol::PeerId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::connection::ConnectionEvent;
use crate::endpoint::Endpoint;
use crate::metrics::TrackerMetrics;
use crate::{NetworkError, Result};

enum TrackerInput {
    Connection(ConnectionEvent),
    Snapshot(oneshot::Sender<TrackerSnapshot>),
    Stop,
}

/// A tracker running on the current tokio runtime.
#[derive(Debug)]
pub struct RunningTracker {
    peer_id: PeerId,
    endpoint: Endpoint,
    inbox: mpsc::UnboundedSender<TrackerInput>,
    metrics: TrackerMetrics,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for TrackerInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(event) => f.debug_tuple("Connection").field(event).finish(),
            Self::Snapshot(_) => f.write_str("Snapshot"),
            Self::Stop => f.write_str("Stop"),
        }
    }
}

/// Validates `config`, binds the listener and starts the tracker.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the listener cannot
/// be bound.
pub async fn start_tracker(config: TrackerConfig) -> Result<RunningTracker> {
    config.validate()?;

    let (inbox, mut queue) = mpsc::unbounded_channel();
    let events = inbox.clone();
    let endpoint = Endpoint::start(config.endpoint_config(), move |event| {
        events.send(TrackerInput::Connection(event)).is_ok()
    })
    .await?;

    info!(
        tracker = %config.name,
        peer_id = %config.peer_id,
        url = %endpoint.url(),
        max_neighbors = config.max_neighbors_per_node,
        "Tracker started"
    );

    let peer_id = config.peer_id.clone();
    let metrics = TrackerMetrics::new();
    let mut coordinator = Coordinator::new(config, metrics.clone());
    let task = tokio::spawn(async move {
        while let Some(input) = queue.recv().await {
            match input {
                TrackerInput::Connection(event) => coordinator.handle_event(event),
                TrackerInput::Snapshot(reply) => {
                    let _ = reply.send(coordinator.snapshot());
                }
                TrackerInput::Stop => break,
            }
        }
        coordinator.shutdown();
    });

    Ok(RunningTracker {
        peer_id,
        endpoint,
        inbox,
        metrics,
        task,
    })
}

impl RunningTracker {
    /// Returns the tracker's id.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Returns the bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Returns the URL nodes connect to.
    #[must_use]
    pub fn url(&self) -> String {
        self.endpoint.url()
    }

    /// Returns a copy of the coordinator state.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::NotRunning`] if the tracker has stopped.
    pub async fn snapshot(&self) -> Result<TrackerSnapshot> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(TrackerInput::Snapshot(reply))
            .map_err(|_| NetworkError::NotRunning)?;
        response.await.map_err(|_| NetworkError::NotRunning)
    }

    /// Resolves once the coordinator task has ended, whether through
    /// [`stop`](Self::stop) or a fault.
    pub async fn closed(&self) {
        self.inbox.closed().await;
    }

    /// Returns the metrics in the Prometheus text format.
    #[must_use]
    pub fn metrics_text(&self) -> String {
        self.metrics.encode()
    }

    /// Stops accepting, closes every connection and waits for the
    /// coordinator task to finish.
    pub async fn stop(self) {
        self.endpoint.stop();
        let _ = self.inbox.send(TrackerInput::Stop);
        let _ = self.task.await;
        info!(peer_id = %self.peer_id, "Tracker stopped");
    }
}
