//! In-memory message store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use strand_protocol::{MessageRef, StreamMessage, StreamPartition};
use tracing::trace;

use crate::{MessageStore, MessageStream, Result};

type PartitionLog = BTreeMap<(MessageRef, String), StreamMessage>;

/// An in-memory store keeping messages ordered per partition.
///
/// With a capacity set, each partition keeps only its newest `capacity`
/// messages.
#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<StreamPartition, PartitionLog>>,
    capacity: Option<usize>,
}

impl MemoryStore {
    /// Creates an unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store keeping at most `capacity` messages per partition.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    /// Inserts a message; returns false if it was already present.
    pub fn insert(&self, message: StreamMessage) -> bool {
        let key = (message.message_ref(), message.publisher_id.clone());
        let mut partitions = self.partitions.write();
        let log = partitions
            .entry(message.stream_partition.clone())
            .or_default();
        if log.contains_key(&key) {
            return false;
        }
        log.insert(key, message);
        if let Some(capacity) = self.capacity {
            while log.len() > capacity {
                if let Some((evicted, _)) = log.pop_first() {
                    trace!(message_ref = %evicted.0, "Evicted buffered message");
                }
            }
        }
        true
    }

    /// Returns the number of messages held for a partition.
    #[must_use]
    pub fn len(&self, sp: &StreamPartition) -> usize {
        self.partitions.read().get(sp).map_or(0, BTreeMap::len)
    }

    /// Returns true if nothing is held for a partition.
    #[must_use]
    pub fn is_empty(&self, sp: &StreamPartition) -> bool {
        self.len(sp) == 0
    }

    /// Drops everything held for a partition.
    pub fn remove_partition(&self, sp: &StreamPartition) {
        self.partitions.write().remove(sp);
    }

    fn select<F>(
        &self,
        sp: &StreamPartition,
        publisher_id: Option<&str>,
        keep: F,
    ) -> Vec<StreamMessage>
    where
        F: Fn(&StreamMessage) -> bool,
    {
        let partitions = self.partitions.read();
        let Some(log) = partitions.get(sp) else {
            return Vec::new();
        };
        log.values()
            .filter(|m| publisher_id.map_or(true, |p| m.publisher_id == p))
            .filter(|m| keep(m))
            .cloned()
            .collect()
    }
}

fn into_stream(messages: Vec<StreamMessage>) -> MessageStream {
    stream::iter(messages.into_iter().map(Ok)).boxed()
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn store(&self, message: StreamMessage) -> Result<()> {
        self.insert(message);
        Ok(())
    }

    async fn fetch_latest(&self, sp: &StreamPartition, count: u64) -> Result<MessageStream> {
        let all = self.select(sp, None, |_| true);
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        let skip = all.len().saturating_sub(count);
        Ok(into_stream(all.into_iter().skip(skip).collect()))
    }

    async fn fetch_from_timestamp(
        &self,
        sp: &StreamPartition,
        from: i64,
        publisher_id: Option<&str>,
    ) -> Result<MessageStream> {
        Ok(into_stream(
            self.select(sp, publisher_id, |m| m.timestamp >= from),
        ))
    }

    async fn fetch_between_timestamps(
        &self,
        sp: &StreamPartition,
        from: i64,
        to: i64,
        publisher_id: Option<&str>,
    ) -> Result<MessageStream> {
        Ok(into_stream(self.select(sp, publisher_id, |m| {
            m.timestamp >= from && m.timestamp <= to
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect;

    fn sp() -> StreamPartition {
        StreamPartition::new("stream-1", 0)
    }

    fn msg(ts: i64, seq: u32, publisher: &str) -> StreamMessage {
        StreamMessage::new(sp(), publisher, MessageRef::new(ts, seq), b"x".to_vec())
    }

    fn fixture() -> MemoryStore {
        let store = MemoryStore::new();
        // inserted out of order on purpose
        let positions = [
            (4000, 0),
            (0, 0),
            (2500, 2),
            (1000, 0),
            (2500, 0),
            (3000, 0),
            (2000, 0),
            (2500, 1),
        ];
        for (ts, seq) in positions {
            store.insert(msg(ts, seq, "publisher"));
        }
        store
    }

    fn refs(messages: &[StreamMessage]) -> Vec<(i64, u32)> {
        messages
            .iter()
            .map(|m| (m.timestamp, m.sequence_number))
            .collect()
    }

    #[tokio::test]
    async fn fetch_between_is_inclusive_and_ordered() {
        let store = fixture();
        let stream = store
            .fetch_between_timestamps(&sp(), 1500, 3500, None)
            .await
            .unwrap();
        let got = collect(stream).await.unwrap();
        assert_eq!(
            refs(&got),
            vec![(2000, 0), (2500, 0), (2500, 1), (2500, 2), (3000, 0)]
        );

        let stream = store
            .fetch_between_timestamps(&sp(), 1000, 2000, None)
            .await
            .unwrap();
        let edges = collect(stream).await.unwrap();
        assert_eq!(refs(&edges), vec![(1000, 0), (2000, 0)]);
    }

    #[tokio::test]
    async fn fetch_latest_returns_tail_ascending() {
        let store = fixture();
        let got = collect(store.fetch_latest(&sp(), 3).await.unwrap()).await.unwrap();
        assert_eq!(refs(&got), vec![(2500, 2), (3000, 0), (4000, 0)]);

        let all = collect(store.fetch_latest(&sp(), 100).await.unwrap()).await.unwrap();
        assert_eq!(all.len(), 8);
    }

    #[tokio::test]
    async fn fetch_from_timestamp_filters_publisher() {
        let store = fixture();
        store.insert(msg(3500, 0, "other"));
        let got = collect(store.fetch_from_timestamp(&sp(), 3000, None).await.unwrap())
            .await
            .unwrap();
        assert_eq!(refs(&got), vec![(3000, 0), (3500, 0), (4000, 0)]);

        let only_other = collect(
            store
                .fetch_from_timestamp(&sp(), 0, Some("other"))
                .await
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(refs(&only_other), vec![(3500, 0)]);
    }

    #[tokio::test]
    async fn unknown_partition_is_empty() {
        let store = fixture();
        let other = StreamPartition::new("stream-1", 1);
        let got = collect(store.fetch_latest(&other, 10).await.unwrap()).await.unwrap();
        assert!(got.is_empty());
        assert!(store.is_empty(&other));
    }

    #[test]
    fn duplicates_are_ignored() {
        let store = MemoryStore::new();
        assert!(store.insert(msg(1, 0, "p")));
        assert!(!store.insert(msg(1, 0, "p")));
        assert!(store.insert(msg(1, 0, "q")));
        assert_eq!(store.len(&sp()), 2);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let store = MemoryStore::with_capacity(2);
        store.insert(msg(3, 0, "p"));
        store.insert(msg(1, 0, "p"));
        store.insert(msg(2, 0, "p"));
        assert_eq!(store.len(&sp()), 2);
        let held = store.select(&sp(), None, |_| true);
        assert_eq!(refs(&held), vec![(2, 0), (3, 0)]);
    }
}
