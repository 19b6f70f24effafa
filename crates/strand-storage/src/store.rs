//! The message store interface.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use strand_protocol::{StreamMessage, StreamPartition};

use crate::Result;

/// A finite stream of messages in ascending `(timestamp, sequence_number)`
/// order.
pub type MessageStream = BoxStream<'static, Result<StreamMessage>>;

/// Persistent message storage consulted by the resend server.
///
/// Every fetch returns a finite stream in ascending order. Timestamp bounds
/// are inclusive; `publisher_id` restricts the result to one publisher.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Stores a message.
    async fn store(&self, message: StreamMessage) -> Result<()>;

    /// Fetches the last `count` messages of a partition.
    async fn fetch_latest(&self, sp: &StreamPartition, count: u64) -> Result<MessageStream>;

    /// Fetches messages with `timestamp >= from`.
    async fn fetch_from_timestamp(
        &self,
        sp: &StreamPartition,
        from: i64,
        publisher_id: Option<&str>,
    ) -> Result<MessageStream>;

    /// Fetches messages with `from <= timestamp <= to`.
    async fn fetch_between_timestamps(
        &self,
        sp: &StreamPartition,
        from: i64,
        to: i64,
        publisher_id: Option<&str>,
    ) -> Result<MessageStream>;
}

#[async_trait]
impl<T: MessageStore + ?Sized> MessageStore for Arc<T> {
    async fn store(&self, message: StreamMessage) -> Result<()> {
        (**self).store(message).await
    }

    async fn fetch_latest(&self, sp: &StreamPartition, count: u64) -> Result<MessageStream> {
        (**self).fetch_latest(sp, count).await
    }

    async fn fetch_from_timestamp(
        &self,
        sp: &StreamPartition,
        from: i64,
        publisher_id: Option<&str>,
    ) -> Result<MessageStream> {
        (**self).fetch_from_timestamp(sp, from, publisher_id).await
    }

    async fn fetch_between_timestamps(
        &self,
        sp: &StreamPartition,
        from: i64,
        to: i64,
        publisher_id: Option<&str>,
    ) -> Result<MessageStream> {
        (**self)
            .fetch_between_timestamps(sp, from, to, publisher_id)
            .await
    }
}

/// Drains a message stream into a vector, stopping at the first error.
///
/// # Errors
///
/// Returns the first error the stream yields.
pub async fn collect(mut stream: MessageStream) -> Result<Vec<StreamMessage>> {
    let mut out = Vec::new();
    while let Some(item) = stream.next().await {
        out.push(item?);
    }
    Ok(out)
}
