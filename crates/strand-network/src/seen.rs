//! Duplicate detection for propagated messages.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use strand_protocol::MessageId;

/// Remembers recently seen message ids.
///
/// Bounded both by entry count and by age: an id older than the TTL is
/// treated as unseen.
#[derive(Debug)]
pub struct SeenCache {
    entries: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl SeenCache {
    /// Creates a cache of at most `capacity` ids (minimum one).
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Records an id; returns true if it had not been seen.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.entries.put(id, Instant::now());
        true
    }

    /// Returns true if the id was seen within the TTL.
    pub fn contains(&mut self, id: &MessageId) -> bool {
        let fresh = match self.entries.peek(id) {
            Some(seen_at) => seen_at.elapsed() <= self.ttl,
            None => return false,
        };
        if !fresh {
            self.entries.pop(id);
        }
        fresh
    }

    /// Returns the number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
