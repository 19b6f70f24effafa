//! Overlay node.
//!
//! A node subscribes to stream partitions, reports them to a tracker,
//! connects to the neighbors the tracker assigns and propagates data
//! messages to them. It also answers resend requests from its buffer or a
//! storage backend.
//!
//! [`OverlayNode`] holds the state and is driven by one task;
//! [`NetworkNode`] is the handle applications use.

mod config;
mod overlay;
mod propagation;
mod resend;
mod signalling;
mod subscription;

pub use config::NodeConfig;
pub use overlay::{tracker_index, NodeSnapshot, OverlayNode, SubscriptionSnapshot};
pub use resend::{serve, ResendEvent, ResendOutcome, STORAGE_ERROR_CODE};
pub use subscription::SubscriptionState;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use strand_protocol::{PeerId, PeerRole, ResendRequest, StreamMessage, StreamPartition};
use strand_storage::MessageStore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::connection::ConnectionEvent;
use crate::endpoint::Endpoint;
use crate::metrics::NodeMetrics;
use crate::scheduler::PeriodicTask;
use crate::{NetworkError, Result};

enum NodeCommand {
    Subscribe(StreamPartition),
    Unsubscribe(StreamPartition),
    Publish(StreamMessage),
    AddListener(oneshot::Sender<mpsc::UnboundedReceiver<StreamMessage>>),
    Resend {
        peer: PeerId,
        request: ResendRequest,
        reply: oneshot::Sender<Result<mpsc::UnboundedReceiver<ResendEvent>>>,
    },
    Neighbors(StreamPartition, oneshot::Sender<Vec<PeerId>>),
    Snapshot(oneshot::Sender<NodeSnapshot>),
}

enum NodeInput {
    Connection(ConnectionEvent),
    Command(NodeCommand),
    StatusTick,
    RetryTick,
    Stop,
}

impl fmt::Debug for NodeInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(event) => f.debug_tuple("Connection").field(event).finish(),
            Self::Command(_) => f.write_str("Command"),
            Self::StatusTick => f.write_str("StatusTick"),
            Self::RetryTick => f.write_str("RetryTick"),
            Self::Stop => f.write_str("Stop"),
        }
    }
}

/// An overlay node running on the current tokio runtime.
#[derive(Debug)]
pub struct NetworkNode {
    peer_id: PeerId,
    endpoint: Endpoint,
    inbox: mpsc::UnboundedSender<NodeInput>,
    metrics: NodeMetrics,
    ticks: Vec<PeriodicTask>,
    task: JoinHandle<()>,
}

fn ticker(
    inbox: &mpsc::UnboundedSender<NodeInput>,
    interval: std::time::Duration,
    input: fn() -> NodeInput,
) -> PeriodicTask {
    let inbox = inbox.clone();
    PeriodicTask::spawn(interval, false, move || {
        let _ = inbox.send(input());
        async {}
    })
}

impl NetworkNode {
    /// Validates `config`, binds the listener, dials the trackers and
    /// starts the node.
    ///
    /// `store` serves resends and persists delivered messages; a node with
    /// the storage role must have one.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the listener
    /// cannot be bound.
    pub async fn start(
        config: NodeConfig,
        store: Option<Arc<dyn MessageStore>>,
    ) -> Result<Self> {
        config.validate()?;
        if config.peer_info.role == PeerRole::Storage && store.is_none() {
            return Err(NetworkError::Config(
                "a storage node needs a message store".into(),
            ));
        }

        let (inbox, mut queue) = mpsc::unbounded_channel();
        let events = inbox.clone();
        let endpoint = Endpoint::start(config.endpoint_config(), move |event| {
            events.send(NodeInput::Connection(event)).is_ok()
        })
        .await?;

        let advertised = config.advertised(endpoint.local_addr());
        info!(
            peer = %config.peer_info,
            urls = ?advertised,
            trackers = ?config.trackers,
            "Node started"
        );

        let peer_id = config.peer_info.peer_id.clone();
        let metrics = NodeMetrics::new();
        let ticks = vec![
            ticker(&inbox, config.status_interval, || NodeInput::StatusTick),
            ticker(&inbox, config.retry_interval, || NodeInput::RetryTick),
        ];
        let mut node = OverlayNode::new(
            config,
            advertised,
            Arc::new(endpoint.clone()),
            store,
            metrics.clone(),
        );
        node.start();

        let task = tokio::spawn(async move {
            while let Some(input) = queue.recv().await {
                match input {
                    NodeInput::Connection(event) => node.handle_event(event),
                    NodeInput::Command(command) => apply(&mut node, command),
                    NodeInput::StatusTick => node.report_status(),
                    NodeInput::RetryTick => node.retry_tick(),
                    NodeInput::Stop => break,
                }
            }
            node.shutdown();
        });

        Ok(Self {
            peer_id,
            endpoint,
            inbox,
            metrics,
            ticks,
            task,
        })
    }

    /// Returns the node's id.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Returns the bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Returns a `ws://` URL for the bound address.
    #[must_use]
    pub fn url(&self) -> String {
        self.endpoint.url()
    }

    fn command(&self, command: NodeCommand) -> Result<()> {
        self.inbox
            .send(NodeInput::Command(command))
            .map_err(|_| NetworkError::NotRunning)
    }

    async fn query<T>(&self, command: NodeCommand, response: oneshot::Receiver<T>) -> Result<T> {
        self.command(command)?;
        response.await.map_err(|_| NetworkError::NotRunning)
    }

    /// Joins a partition.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::NotRunning`] if the node has stopped.
    pub fn subscribe(&self, sp: StreamPartition) -> Result<()> {
        self.command(NodeCommand::Subscribe(sp))
    }

    /// Leaves a partition.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::NotRunning`] if the node has stopped.
    pub fn unsubscribe(&self, sp: StreamPartition) -> Result<()> {
        self.command(NodeCommand::Unsubscribe(sp))
    }

    /// Publishes a message to its partition.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::NotRunning`] if the node has stopped.
    pub fn publish(&self, message: StreamMessage) -> Result<()> {
        self.command(NodeCommand::Publish(message))
    }

    /// Returns a receiver for every message delivered from now on.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::NotRunning`] if the node has stopped.
    pub async fn add_message_listener(&self) -> Result<mpsc::UnboundedReceiver<StreamMessage>> {
        let (reply, response) = oneshot::channel();
        self.query(NodeCommand::AddListener(reply), response).await
    }

    /// Requests a resend from a connected peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the node has stopped or the peer is not
    /// connected.
    pub async fn request_resend(
        &self,
        peer: PeerId,
        request: ResendRequest,
    ) -> Result<mpsc::UnboundedReceiver<ResendEvent>> {
        let (reply, response) = oneshot::channel();
        self.query(
            NodeCommand::Resend {
                peer,
                request,
                reply,
            },
            response,
        )
        .await?
    }

    /// Returns the live neighbors of a partition.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::NotRunning`] if the node has stopped.
    pub async fn neighbors(&self, sp: StreamPartition) -> Result<Vec<PeerId>> {
        let (reply, response) = oneshot::channel();
        self.query(NodeCommand::Neighbors(sp, reply), response).await
    }

    /// Returns a copy of the node state.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::NotRunning`] if the node has stopped.
    pub async fn snapshot(&self) -> Result<NodeSnapshot> {
        let (reply, response) = oneshot::channel();
        self.query(NodeCommand::Snapshot(reply), response).await
    }

    /// Returns the metrics in the Prometheus text format.
    #[must_use]
    pub fn metrics_text(&self) -> String {
        self.metrics.encode()
    }

    /// Stops the node and waits for its task to finish.
    pub async fn stop(self) {
        for tick in &self.ticks {
            tick.stop();
        }
        self.endpoint.stop();
        let _ = self.inbox.send(NodeInput::Stop);
        let _ = self.task.await;
        info!(peer_id = %self.peer_id, "Node stopped");
    }
}

fn apply(node: &mut OverlayNode, command: NodeCommand) {
    match command {
        NodeCommand::Subscribe(sp) => node.subscribe(sp),
        NodeCommand::Unsubscribe(sp) => node.unsubscribe(&sp),
        NodeCommand::Publish(message) => node.publish(message),
        NodeCommand::AddListener(reply) => {
            let _ = reply.send(node.add_listener());
        }
        NodeCommand::Resend {
            peer,
            request,
            reply,
        } => {
            let _ = reply.send(node.request_resend(&peer, request));
        }
        NodeCommand::Neighbors(sp, reply) => {
            let _ = reply.send(node.neighbors(&sp));
        }
        NodeCommand::Snapshot(reply) => {
            let _ = reply.send(node.snapshot());
        }
    }
}
