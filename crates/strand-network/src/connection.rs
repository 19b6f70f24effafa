//! Live connection handles and the events connections report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strand_protocol::{encode, Message, PeerId, PeerInfo};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::{NetworkError, Result};

/// Process-unique identifier of one connection.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const UNKNOWN_RTT: u64 = u64::MAX;

/// Bulk frames a connection may have queued but not yet written.
pub const DATA_WINDOW: usize = 64;

/// Frames queued for a connection's writer.
#[derive(Debug)]
pub enum Outbound {
    /// A text frame carrying one envelope.
    Text(String),
    /// A bulk text frame. It holds one slot of the connection's data window
    /// until the writer is done with it.
    Data(String, OwnedSemaphorePermit),
    /// Close the connection.
    Close,
}

impl Outbound {
    /// Returns the envelope text, if this is a text frame.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) | Self::Data(text, _) => Some(text),
            Self::Close => None,
        }
    }
}

/// Sending side of a live connection.
///
/// Control sends never block: frames are queued for the connection's writer
/// task. Bulk sends first [`reserve`](Self::reserve) a slot of the data
/// window, so a slow reader holds back at most [`DATA_WINDOW`] of them.
/// The connection closes once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<Outbound>,
    window: Arc<Semaphore>,
    rtt: Arc<AtomicU64>,
}

/// A reserved slot of a connection's data window.
#[derive(Debug)]
pub struct DataSlot<'a> {
    handle: &'a ConnectionHandle,
    permit: OwnedSemaphorePermit,
}

impl DataSlot<'_> {
    /// Encodes and queues a message in the reserved slot.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the connection is gone.
    pub fn send(self, message: &Message) -> Result<()> {
        let text = encode(message)?;
        self.handle
            .sender
            .send(Outbound::Data(text, self.permit))
            .map_err(|_| NetworkError::ChannelClosed)
    }
}

impl ConnectionHandle {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Outbound>, rtt: Arc<AtomicU64>) -> Self {
        Self::with_window(sender, rtt, DATA_WINDOW)
    }

    fn with_window(
        sender: mpsc::UnboundedSender<Outbound>,
        rtt: Arc<AtomicU64>,
        window: usize,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            sender,
            window: Arc::new(Semaphore::new(window.max(1))),
            rtt,
        }
    }

    /// Creates a handle that is not backed by a socket, together with the
    /// receiver its frames end up in.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        Self::channel_with_window(DATA_WINDOW)
    }

    /// Like [`channel`](Self::channel) with a data window of `window`
    /// frames.
    #[must_use]
    pub fn channel_with_window(window: usize) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self::with_window(sender, Self::unknown_rtt(), window),
            receiver,
        )
    }

    /// Returns the connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ChannelClosed`] if the connection is gone.
    pub fn send_text(&self, text: String) -> Result<()> {
        self.sender
            .send(Outbound::Text(text))
            .map_err(|_| NetworkError::ChannelClosed)
    }

    /// Encodes and queues a message.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the connection is gone.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.send_text(encode(message)?)
    }

    /// Waits for a free slot of the data window.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ChannelClosed`] if the connection closes
    /// first.
    pub async fn reserve(&self) -> Result<DataSlot<'_>> {
        let permit = tokio::select! {
            () = self.sender.closed() => return Err(NetworkError::ChannelClosed),
            permit = self.window.clone().acquire_owned() => {
                permit.map_err(|_| NetworkError::ChannelClosed)?
            }
        };
        Ok(DataSlot {
            handle: self,
            permit,
        })
    }

    /// Asks the writer to close the connection.
    pub fn close(&self) {
        let _ = self.sender.send(Outbound::Close);
    }

    /// Returns true once the connection's writer has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves when the connection's writer has stopped.
    pub async fn closed(&self) {
        self.sender.closed().await;
    }

    /// Returns the last measured round-trip time in milliseconds.
    #[must_use]
    pub fn rtt(&self) -> Option<u64> {
        match self.rtt.load(Ordering::Relaxed) {
            UNKNOWN_RTT => None,
            rtt => Some(rtt),
        }
    }

    pub(crate) fn unknown_rtt() -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(UNKNOWN_RTT))
    }
}

/// Events the transport reports to the owning event loop.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A connection finished its handshake.
    Connected {
        /// The remote peer.
        peer: PeerInfo,
        /// The URL dialed, or the remote socket address for accepted
        /// connections.
        address: String,
        /// True if this side dialed.
        outbound: bool,
        /// Handle for sending to the peer.
        handle: ConnectionHandle,
    },
    /// A connection closed.
    Disconnected {
        /// The remote peer.
        peer_id: PeerId,
        /// The connection that closed.
        connection_id: ConnectionId,
    },
    /// A text frame arrived.
    MessageReceived {
        /// The remote peer.
        peer_id: PeerId,
        /// The raw envelope.
        text: String,
    },
    /// A dial attempt failed.
    ConnectFailed {
        /// The URL dialed.
        address: String,
        /// Why it failed.
        reason: String,
    },
}
