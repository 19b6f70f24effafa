//! Per-partition subscription state.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use strand_protocol::{MessageRef, PeerId};

use crate::seen::SeenCache;

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Interest registered, no neighbor yet.
    Subscribing,
    /// At least one neighbor is live, or none is required.
    Subscribed,
}

/// A partition the node takes part in.
#[derive(Debug)]
pub(crate) struct Subscription {
    pub(crate) state: SubscriptionState,
    /// Live neighbors.
    pub(crate) neighbors: BTreeSet<PeerId>,
    /// Neighbors the tracker asked for.
    pub(crate) targets: BTreeSet<PeerId>,
    /// Counter of the last applied instruction.
    pub(crate) counter: u64,
    /// Last delivered message per recently active publisher.
    last_delivered: LruCache<String, MessageRef>,
    pub(crate) seen: SeenCache,
}

impl Subscription {
    pub(crate) fn new(
        seen_cache_size: usize,
        seen_cache_ttl: Duration,
        max_tracked_publishers: usize,
    ) -> Self {
        let publishers = NonZeroUsize::new(max_tracked_publishers).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: SubscriptionState::Subscribing,
            neighbors: BTreeSet::new(),
            targets: BTreeSet::new(),
            counter: 0,
            last_delivered: LruCache::new(publishers),
            seen: SeenCache::new(seen_cache_size, seen_cache_ttl),
        }
    }

    /// Adds a live neighbor; returns true if it was not one already.
    pub(crate) fn add_neighbor(&mut self, peer: PeerId) -> bool {
        let added = self.neighbors.insert(peer);
        if added {
            self.state = SubscriptionState::Subscribed;
        }
        added
    }

    /// Removes a neighbor; returns true if it was one.
    pub(crate) fn remove_neighbor(&mut self, peer: &PeerId) -> bool {
        self.neighbors.remove(peer)
    }

    /// Returns true if the peer is a neighbor or a target.
    pub(crate) fn involves(&self, peer: &PeerId) -> bool {
        self.neighbors.contains(peer) || self.targets.contains(peer)
    }

    /// Returns the last message delivered from `publisher`, if it is
    /// still tracked.
    pub(crate) fn last_delivered(&mut self, publisher: &str) -> Option<MessageRef> {
        self.last_delivered.get(publisher).copied()
    }

    /// Records a delivered message; the reference only moves forward. The
    /// least recently active publisher is forgotten once the bound is hit.
    pub(crate) fn delivered(&mut self, publisher: &str, message_ref: MessageRef) {
        match self.last_delivered.get_mut(publisher) {
            Some(last) if *last >= message_ref => {}
            Some(last) => *last = message_ref,
            None => {
                self.last_delivered.put(publisher.to_string(), message_ref);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_neighbor_completes_subscription() {
        let mut sub = Subscription::new(16, Duration::from_secs(60), 16);
        assert_eq!(sub.state, SubscriptionState::Subscribing);
        assert!(sub.add_neighbor(PeerId::new("a")));
        assert!(!sub.add_neighbor(PeerId::new("a")));
        assert_eq!(sub.state, SubscriptionState::Subscribed);
        assert!(sub.remove_neighbor(&PeerId::new("a")));
        assert!(!sub.involves(&PeerId::new("a")));
    }

    #[test]
    fn last_delivered_only_moves_forward() {
        let mut sub = Subscription::new(16, Duration::from_secs(60), 16);
        sub.delivered("p", MessageRef::new(2000, 0));
        sub.delivered("p", MessageRef::new(1000, 5));
        assert_eq!(sub.last_delivered("p"), Some(MessageRef::new(2000, 0)));
        sub.delivered("p", MessageRef::new(2000, 1));
        assert_eq!(sub.last_delivered("p"), Some(MessageRef::new(2000, 1)));
    }

    #[test]
    fn idle_publishers_are_forgotten() {
        let mut sub = Subscription::new(16, Duration::from_secs(60), 2);
        sub.delivered("a", MessageRef::new(1000, 0));
        sub.delivered("b", MessageRef::new(1000, 0));
        // "a" is active again, so "b" is the one evicted.
        sub.delivered("a", MessageRef::new(2000, 0));
        sub.delivered("c", MessageRef::new(1000, 0));

        assert_eq!(sub.last_delivered("a"), Some(MessageRef::new(2000, 0)));
        assert_eq!(sub.last_delivered("b"), None);
        assert_eq!(sub.last_delivered("c"), Some(MessageRef::new(1000, 0)));
    }
}
