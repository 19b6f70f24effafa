//! WebSocket transport.
//!
//! Every process runs one [`Endpoint`]: it accepts connections, dials
//! peers, and reports everything that happens as [`ConnectionEvent`]s to the
//! owning event loop. Peers identify themselves during the HTTP upgrade with
//! the [`PEER_ID_HEADER`] and [`PEER_ROLE_HEADER`] headers, in both the
//! request and the response.
//!
//! Each connection runs in its own task. The task holds the receiving end of
//! the connection's outbound queue, so dropping every [`ConnectionHandle`]
//! closes the socket. Ping frames carry the send time and the matching pong
//! yields the round-trip time; a connection that answers no ping for three
//! intervals is dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use strand_protocol::{PeerId, PeerInfo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectionEvent, ConnectionHandle, Outbound};
use crate::{NetworkError, Result};

/// Header carrying the peer id during the upgrade.
pub const PEER_ID_HEADER: &str = "x-strand-peer-id";

/// Header carrying the peer role during the upgrade.
pub const PEER_ROLE_HEADER: &str = "x-strand-peer-role";

/// Missed pongs after which a connection is considered dead.
const MAX_MISSED_PONGS: u32 = 3;

/// Receives every event of an endpoint; returns false once the owner is
/// gone.
pub type EventSink = Arc<dyn Fn(ConnectionEvent) -> bool + Send + Sync>;

/// Transport settings.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Identity announced to peers.
    pub peer_info: PeerInfo,
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Bound on dialing and on the upgrade handshake.
    pub connect_timeout: Duration,
}

/// Dials peers.
///
/// The node core depends on this rather than on [`Endpoint`] so that it can
/// be driven without sockets.
pub trait Connector: Send + Sync + 'static {
    /// Starts dialing `address`; the outcome arrives later as a
    /// [`ConnectionEvent`].
    fn connect(&self, address: String);
}

struct Inner {
    config: EndpointConfig,
    local_addr: SocketAddr,
    sink: EventSink,
    id_header: HeaderValue,
    role_header: HeaderValue,
    shutdown: CancellationToken,
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) -> bool {
        (self.sink)(event)
    }
}

/// A listening WebSocket endpoint.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer", &self.inner.config.peer_info)
            .field("local_addr", &self.inner.local_addr)
            .finish()
    }
}

impl Endpoint {
    /// Binds the listener and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer id cannot be sent as a header or the
    /// listener cannot be bound.
    pub async fn start<F>(config: EndpointConfig, sink: F) -> Result<Self>
    where
        F: Fn(ConnectionEvent) -> bool + Send + Sync + 'static,
    {
        let id_header = HeaderValue::from_str(config.peer_info.peer_id.as_str())
            .map_err(|e| NetworkError::Config(format!("peer id is not a valid header: {e}")))?;
        let role_header = HeaderValue::from_static(config.peer_info.role.as_str());

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            peer = %config.peer_info,
            addr = %local_addr,
            "Endpoint listening"
        );

        let inner = Arc::new(Inner {
            config,
            local_addr,
            sink: Arc::new(sink),
            id_header,
            role_header,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(accept_loop(inner.clone(), listener));
        Ok(Self { inner })
    }

    /// Returns the bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Returns a `ws://` URL for the bound address.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.inner.local_addr)
    }

    /// Returns the identity this endpoint announces.
    #[must_use]
    pub fn peer_info(&self) -> &PeerInfo {
        &self.inner.config.peer_info
    }

    /// Stops accepting and closes every connection.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Connector for Endpoint {
    fn connect(&self, address: String) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let timeout = inner.config.connect_timeout;
            let outcome = tokio::select! {
                () = inner.shutdown.cancelled() => return,
                outcome = tokio::time::timeout(timeout, dial(&inner, &address)) => outcome,
            };
            match outcome {
                Ok(Ok((ws, peer))) => run_connection(inner, ws, peer, address, true).await,
                Ok(Err(e)) => {
                    debug!(address = %address, error = %e, "Dial failed");
                    inner.emit(ConnectionEvent::ConnectFailed {
                        address,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    debug!(address = %address, "Dial timed out");
                    inner.emit(ConnectionEvent::ConnectFailed {
                        address,
                        reason: "timed out".into(),
                    });
                }
            }
        });
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_connection(inner, stream, remote).await {
                        debug!(remote = %remote, error = %e, "Rejected incoming connection");
                    }
                });
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }
    debug!(addr = %inner.local_addr, "Endpoint stopped accepting");
}

async fn accept_connection(inner: Arc<Inner>, stream: TcpStream, remote: SocketAddr) -> Result<()> {
    let mut remote_peer = None;
    let callback = |request: &Request, mut response: Response| {
        match peer_info_from_headers(request.headers()) {
            Some(peer) => {
                remote_peer = Some(peer);
                let headers = response.headers_mut();
                headers.insert(PEER_ID_HEADER, inner.id_header.clone());
                headers.insert(PEER_ROLE_HEADER, inner.role_header.clone());
                Ok(response)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some("missing peer identity".into()));
                *rejection.status_mut() = StatusCode::BAD_REQUEST;
                Err(rejection)
            }
        }
    };

    let ws = tokio::time::timeout(
        inner.config.connect_timeout,
        accept_hdr_async(stream, callback),
    )
    .await
    .map_err(|_| NetworkError::Connection("handshake timed out".into()))??;

    let peer = remote_peer
        .ok_or_else(|| NetworkError::Connection("peer did not identify itself".into()))?;
    run_connection(inner, ws, peer, format!("ws://{remote}"), false).await;
    Ok(())
}

async fn dial(
    inner: &Inner,
    address: &str,
) -> Result<(
    WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    PeerInfo,
)> {
    let mut request = address.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(PEER_ID_HEADER, inner.id_header.clone());
    headers.insert(PEER_ROLE_HEADER, inner.role_header.clone());

    let (ws, response) = connect_async(request).await?;
    let peer = peer_info_from_headers(response.headers())
        .ok_or_else(|| NetworkError::Connection(format!("{address} did not identify itself")))?;
    Ok((ws, peer))
}

fn peer_info_from_headers(headers: &HeaderMap) -> Option<PeerInfo> {
    let peer_id = headers.get(PEER_ID_HEADER)?.to_str().ok()?;
    if peer_id.is_empty() {
        return None;
    }
    let role = headers.get(PEER_ROLE_HEADER)?.to_str().ok()?.parse().ok()?;
    Some(PeerInfo {
        peer_id: PeerId::new(peer_id),
        role,
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn ping_sent_at(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

async fn run_connection<S>(
    inner: Arc<Inner>,
    ws: WebSocketStream<S>,
    peer: PeerInfo,
    address: String,
    outbound: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, mut queue) = mpsc::unbounded_channel();
    let rtt: Arc<AtomicU64> = ConnectionHandle::unknown_rtt();
    let handle = ConnectionHandle::new(sender, rtt.clone());
    let connection_id = handle.id();
    let peer_id = peer.peer_id.clone();

    info!(
        peer = %peer,
        address = %address,
        outbound,
        connection_id,
        "Connection established"
    );
    if !inner.emit(ConnectionEvent::Connected {
        peer,
        address,
        outbound,
        handle,
    }) {
        return;
    }

    let (mut sink, mut stream) = ws.split();
    let ping_interval = inner.config.ping_interval;
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
            frame = queue.recv() => {
                // A bulk frame's window slot is released once it is written.
                let (text, _slot) = match frame {
                    Some(Outbound::Text(text)) => (text, None),
                    Some(Outbound::Data(text, slot)) => (text, Some(slot)),
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = sink.send(WsMessage::text(text)).await {
                    debug!(peer_id = %peer_id, error = %e, "Write failed");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let event = ConnectionEvent::MessageReceived {
                        peer_id: peer_id.clone(),
                        text: text.as_str().to_owned(),
                    };
                    if !inner.emit(event) {
                        break;
                    }
                }
                Some(Ok(WsMessage::Pong(payload))) => {
                    last_pong = Instant::now();
                    if let Some(sent) = ping_sent_at(&payload) {
                        rtt.store(now_millis().saturating_sub(sent), Ordering::Relaxed);
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(peer_id = %peer_id, error = %e, "Read failed");
                    break;
                }
            },
            _ = ping.tick() => {
                if last_pong.elapsed() > ping_interval * MAX_MISSED_PONGS {
                    warn!(peer_id = %peer_id, "Peer stopped answering pings");
                    break;
                }
                let payload = Bytes::from(now_millis().to_be_bytes().to_vec());
                if let Err(e) = sink.send(WsMessage::Ping(payload)).await {
                    debug!(peer_id = %peer_id, error = %e, "Ping failed");
                    break;
                }
                trace!(peer_id = %peer_id, "Ping sent");
            }
        }
    }

    info!(peer_id = %peer_id, connection_id, "Connection closed");
    inner.emit(ConnectionEvent::Disconnected {
        peer_id,
        connection_id,
    });
}
