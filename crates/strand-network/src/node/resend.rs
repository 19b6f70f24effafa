//! Serving and tracking resends.
//!
//! A resend answer is `NoResend` when nothing matches, otherwise
//! `Resending`, one `Unicast` per message in ascending order, then
//! `Resent`. A source failing mid-stream ends the answer with an
//! `ErrorResponse`. Messages go through the connection's data window, and
//! serving stops as soon as the requester's connection is gone.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use strand_protocol::{ErrorResponse, Message, PeerId, ResendRequest, StreamMessage};
use strand_storage::{MemoryStore, MessageStore, MessageStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::protocol::node_to_node::unicast;

/// Error code sent when a source fails mid-stream.
pub const STORAGE_ERROR_CODE: &str = "STORAGE_ERROR";

/// How serving a resend ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResendOutcome {
    /// Nothing matched.
    NoResend,
    /// This many messages were sent.
    Resent(usize),
    /// A source failed after `Resending` was sent.
    Failed(String),
    /// The requester went away.
    Aborted,
}

/// Progress of a resend requested through the node API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResendEvent {
    /// The responder found messages.
    Resending,
    /// One resent message.
    Message(StreamMessage),
    /// All messages were sent.
    Resent,
    /// The responder has nothing.
    NoResend,
    /// The resend failed or the responder disconnected.
    Failed(String),
}

impl ResendEvent {
    /// Returns true if no event follows this one.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resent | Self::NoResend | Self::Failed(_))
    }
}

/// Who waits for the answer of an outstanding request.
#[derive(Debug)]
pub(crate) enum ResendWaiter {
    /// The node itself, filling a gap.
    GapFill,
    /// An API caller.
    Client(mpsc::UnboundedSender<ResendEvent>),
}

/// A request this node sent and has not seen the end of.
#[derive(Debug)]
pub(crate) struct PendingResend {
    pub(crate) peer: PeerId,
    pub(crate) waiter: ResendWaiter,
    /// When the request was sent or the responder last answered.
    pub(crate) last_activity: Instant,
}

impl PendingResend {
    pub(crate) fn new(peer: PeerId, waiter: ResendWaiter) -> Self {
        Self {
            peer,
            waiter,
            last_activity: Instant::now(),
        }
    }

    /// Passes an event to the waiter.
    pub(crate) fn notify(&self, event: ResendEvent) {
        if let ResendWaiter::Client(sender) = &self.waiter {
            let _ = sender.send(event);
        }
    }
}

async fn fetch(
    source: &dyn MessageStore,
    request: &ResendRequest,
) -> strand_storage::Result<MessageStream> {
    match request {
        ResendRequest::Last(r) => source.fetch_latest(&r.stream_partition, r.number_last).await,
        ResendRequest::From(r) => {
            source
                .fetch_from_timestamp(
                    &r.stream_partition,
                    r.from_timestamp,
                    r.publisher_id.as_deref(),
                )
                .await
        }
        ResendRequest::Range(r) => {
            source
                .fetch_between_timestamps(
                    &r.stream_partition,
                    r.from_timestamp,
                    r.to_timestamp,
                    r.publisher_id.as_deref(),
                )
                .await
        }
    }
}

/// Answers `request` over `handle`.
///
/// The storage collaborator is consulted first, then the local buffer. A
/// source that fails before yielding anything, or yields nothing, is
/// skipped.
pub async fn serve(
    request: ResendRequest,
    handle: ConnectionHandle,
    store: Option<Arc<dyn MessageStore>>,
    buffer: Arc<MemoryStore>,
) -> ResendOutcome {
    let mut sources: Vec<Arc<dyn MessageStore>> = Vec::new();
    if let Some(store) = store {
        sources.push(store);
    }
    sources.push(buffer);

    for source in sources {
        let mut stream = match fetch(source.as_ref(), &request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(sub_id = request.sub_id(), error = %e, "Resend source failed");
                continue;
            }
        };
        let first = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!(sub_id = request.sub_id(), error = %e, "Resend source failed");
                continue;
            }
            None => continue,
        };
        return stream_answer(&request, &handle, first, stream).await;
    }

    debug!(sub_id = request.sub_id(), mode = request.mode(), "Nothing to resend");
    if handle.send(&Message::NoResend(request.response())).is_err() {
        return ResendOutcome::Aborted;
    }
    ResendOutcome::NoResend
}

/// Streams the answer. Each message waits for a slot of the connection's
/// data window before it is pulled from the source, so a slow requester
/// holds the source back instead of filling memory.
async fn stream_answer(
    request: &ResendRequest,
    handle: &ConnectionHandle,
    first: StreamMessage,
    mut rest: MessageStream,
) -> ResendOutcome {
    if handle.send(&Message::Resending(request.response())).is_err() {
        return ResendOutcome::Aborted;
    }
    let mut next = Some(Ok(first));
    let mut sent = 0;
    loop {
        let Ok(slot) = handle.reserve().await else {
            debug!(sub_id = request.sub_id(), sent, "Requester went away");
            return ResendOutcome::Aborted;
        };
        if next.is_none() {
            next = rest.next().await;
        }
        match next.take() {
            Some(Ok(message)) => {
                if slot.send(&unicast(request, message)).is_err() {
                    debug!(sub_id = request.sub_id(), sent, "Requester went away");
                    return ResendOutcome::Aborted;
                }
                sent += 1;
            }
            Some(Err(e)) => {
                warn!(sub_id = request.sub_id(), sent, error = %e, "Resend aborted by source");
                let response = ErrorResponse {
                    request_id: request.request_id().to_string(),
                    sub_id: request.sub_id().to_string(),
                    stream_partition: request.stream_partition().clone(),
                    error_code: STORAGE_ERROR_CODE.to_string(),
                    message: e.to_string(),
                };
                let _ = handle.send(&Message::ErrorResponse(response));
                return ResendOutcome::Failed(e.to_string());
            }
            None => break,
        }
    }
    if handle.send(&Message::Resent(request.response())).is_err() {
        return ResendOutcome::Aborted;
    }
    debug!(sub_id = request.sub_id(), sent, "Resend complete");
    ResendOutcome::Resent(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use async_trait::async_trait;
    use futures::stream;
    use std::time::Duration;
    use strand_protocol::{
        decode, MessageRef, ResendFromRequest, ResendLastRequest, ResendRangeRequest,
        StreamPartition,
    };
    use strand_storage::StorageError;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn sp() -> StreamPartition {
        StreamPartition::new("stream", 0)
    }

    fn message(timestamp: i64, sequence_number: u32) -> StreamMessage {
        StreamMessage::new(sp(), "publisher", MessageRef::new(timestamp, sequence_number), vec![])
    }

    fn fixture() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        for (ts, seq) in [(0, 0), (1000, 0), (2000, 0), (2500, 0), (2500, 1), (2500, 2), (3000, 0), (4000, 0)] {
            store.insert(message(ts, seq));
        }
        Arc::new(store)
    }

    fn range(from: i64, to: i64) -> ResendRequest {
        ResendRequest::Range(ResendRangeRequest {
            request_id: "req".into(),
            sub_id: "sub".into(),
            stream_partition: sp(),
            from_timestamp: from,
            to_timestamp: to,
            publisher_id: None,
        })
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Some(text) = frame.text() {
                messages.push(decode(text).unwrap());
            }
        }
        messages
    }

    /// Yields one message, then fails.
    struct FlakyStore;

    #[async_trait]
    impl MessageStore for FlakyStore {
        async fn store(&self, _message: StreamMessage) -> strand_storage::Result<()> {
            Ok(())
        }

        async fn fetch_latest(
            &self,
            _sp: &StreamPartition,
            _count: u64,
        ) -> strand_storage::Result<MessageStream> {
            Err(StorageError::Backend("offline".into()))
        }

        async fn fetch_from_timestamp(
            &self,
            _sp: &StreamPartition,
            _from: i64,
            _publisher_id: Option<&str>,
        ) -> strand_storage::Result<MessageStream> {
            Err(StorageError::Backend("offline".into()))
        }

        async fn fetch_between_timestamps(
            &self,
            _sp: &StreamPartition,
            from: i64,
            _to: i64,
            _publisher_id: Option<&str>,
        ) -> strand_storage::Result<MessageStream> {
            let items = vec![
                Ok(message(from, 0)),
                Err(StorageError::Backend("disk failure".into())),
            ];
            Ok(stream::iter(items).boxed())
        }
    }

    #[tokio::test]
    async fn range_resend_streams_matching_messages() {
        let (handle, mut rx) = ConnectionHandle::channel();
        let outcome = serve(range(1500, 3500), handle, None, fixture()).await;
        assert_eq!(outcome, ResendOutcome::Resent(5));

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 7);
        assert!(matches!(messages[0], Message::Resending(_)));
        let refs: Vec<MessageRef> = messages[1..6]
            .iter()
            .map(|m| match m {
                Message::Unicast(u) => {
                    assert_eq!(u.sub_id, "sub");
                    u.stream_message.message_ref()
                }
                other => panic!("expected unicast, got {other:?}"),
            })
            .collect();
        assert_eq!(
            refs,
            vec![
                MessageRef::new(2000, 0),
                MessageRef::new(2500, 0),
                MessageRef::new(2500, 1),
                MessageRef::new(2500, 2),
                MessageRef::new(3000, 0),
            ]
        );
        assert!(matches!(&messages[6], Message::Resent(r) if r.sub_id == "sub"));
    }

    #[tokio::test]
    async fn empty_range_yields_no_resend() {
        let (handle, mut rx) = ConnectionHandle::channel();
        let outcome = serve(range(5000, 6000), handle, None, fixture()).await;
        assert_eq!(outcome, ResendOutcome::NoResend);
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], Message::NoResend(r) if r.request_id == "req"));
    }

    #[tokio::test]
    async fn failing_store_falls_back_to_buffer() {
        let (handle, mut rx) = ConnectionHandle::channel();
        let request = ResendRequest::Last(ResendLastRequest {
            request_id: "req".into(),
            sub_id: "sub".into(),
            stream_partition: sp(),
            number_last: 2,
        });
        let store: Arc<dyn MessageStore> = Arc::new(FlakyStore);
        let outcome = serve(request, handle, Some(store), fixture()).await;
        assert_eq!(outcome, ResendOutcome::Resent(2));
        assert_eq!(drain(&mut rx).len(), 4);
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_error_response() {
        let (handle, mut rx) = ConnectionHandle::channel();
        let store: Arc<dyn MessageStore> = Arc::new(FlakyStore);
        let outcome = serve(range(1500, 3500), handle, Some(store), fixture()).await;
        assert!(matches!(outcome, ResendOutcome::Failed(_)));

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0], Message::Resending(_)));
        assert!(matches!(messages[1], Message::Unicast(_)));
        let Message::ErrorResponse(error) = &messages[2] else {
            panic!("expected error response");
        };
        assert_eq!(error.error_code, STORAGE_ERROR_CODE);
        assert!(error.message.contains("disk failure"));
    }

    #[tokio::test]
    async fn closed_connection_aborts() {
        let (handle, rx) = ConnectionHandle::channel();
        drop(rx);
        let outcome = serve(range(1500, 3500), handle, None, fixture()).await;
        assert_eq!(outcome, ResendOutcome::Aborted);
    }

    #[tokio::test]
    async fn slow_requester_holds_server_at_window() {
        let store = MemoryStore::new();
        for ts in 0..50 {
            store.insert(message(ts, 0));
        }
        let (handle, mut rx) = ConnectionHandle::channel_with_window(4);
        let request = ResendRequest::From(ResendFromRequest {
            request_id: "req".into(),
            sub_id: "sub".into(),
            stream_partition: sp(),
            from_timestamp: 0,
            publisher_id: None,
        });
        let server = tokio::spawn(serve(request, handle, None, Arc::new(store)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Frames that are queued but not yet written keep their slots.
        let mut queued = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            queued.push(frame);
        }
        assert_eq!(queued.len(), 5);
        assert!(matches!(queued[0], Outbound::Text(_)));
        assert!(queued[1..].iter().all(|f| matches!(f, Outbound::Data(..))));
        assert!(!server.is_finished());

        drop(queued);
        let mut rest = 0;
        while rx.recv().await.is_some() {
            rest += 1;
        }
        assert_eq!(rest, 50 - 4 + 1);
        assert_eq!(server.await.unwrap(), ResendOutcome::Resent(50));
    }

    #[tokio::test]
    async fn requester_leaving_mid_stream_aborts() {
        let store = MemoryStore::new();
        for ts in 0..20 {
            store.insert(message(ts, 0));
        }
        let (handle, rx) = ConnectionHandle::channel_with_window(2);
        let server = tokio::spawn(serve(range(0, 100), handle, None, Arc::new(store)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!server.is_finished());

        drop(rx);
        assert_eq!(server.await.unwrap(), ResendOutcome::Aborted);
    }

    #[test]
    fn terminal_events() {
        assert!(ResendEvent::Resent.is_terminal());
        assert!(ResendEvent::Failed("x".into()).is_terminal());
        assert!(!ResendEvent::Resending.is_terminal());
        assert!(!ResendEvent::Message(message(1, 0)).is_terminal());
    }
}
