//! Connection handshakes relayed through a tracker.
//!
//! The initiator sends `rtcConnect`. The receiver answers with `rtcOffer`
//! carrying its first advertised URL and one `iceCandidate` per further
//! URL. The initiator replies `rtcAnswer` and dials the offered URLs in
//! order until one connects. When both sides initiate at once, the greater
//! id gives up its own attempt and answers.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use strand_protocol::{ErrorCode, ErrorMessage, PeerId, RelayMessage, RtcSubType};
use tracing::{debug, info, warn};

use super::overlay::OverlayNode;
use crate::protocol::tracker_node::TrackerNode;
use crate::retry::{Backoff, RetryPolicy};

/// An outgoing handshake.
#[derive(Debug)]
struct Attempt {
    tracker: PeerId,
    started: Instant,
    dialing: Option<String>,
    candidates: VecDeque<String>,
}

/// Outgoing handshakes and per-peer backoff.
#[derive(Debug, Default)]
pub(crate) struct Signalling {
    attempts: HashMap<PeerId, Attempt>,
    backoff: HashMap<PeerId, Backoff>,
}

impl Signalling {
    /// Returns true if no attempt towards `peer` is running and its backoff
    /// has elapsed.
    pub(crate) fn can_initiate(&self, peer: &PeerId, now: Instant) -> bool {
        !self.attempts.contains_key(peer)
            && self.backoff.get(peer).map_or(true, |b| b.ready(now))
    }

    pub(crate) fn started(&mut self, peer: PeerId, tracker: PeerId, now: Instant) {
        self.attempts.insert(
            peer,
            Attempt {
                tracker,
                started: now,
                dialing: None,
                candidates: VecDeque::new(),
            },
        );
    }

    pub(crate) fn is_pending(&self, peer: &PeerId) -> bool {
        self.attempts.contains_key(peer)
    }

    /// Records the offered URL; returns it if it should be dialed now.
    pub(crate) fn offer(&mut self, peer: &PeerId, url: String) -> Option<String> {
        let attempt = self.attempts.get_mut(peer)?;
        attempt.candidates.push_front(url);
        Self::next_dial(attempt)
    }

    /// Records a further URL; returns the URL to dial if nothing is being
    /// dialed.
    pub(crate) fn candidate(&mut self, peer: &PeerId, url: String) -> Option<String> {
        let attempt = self.attempts.get_mut(peer)?;
        attempt.candidates.push_back(url);
        Self::next_dial(attempt)
    }

    fn next_dial(attempt: &mut Attempt) -> Option<String> {
        if attempt.dialing.is_some() {
            return None;
        }
        attempt.dialing = attempt.candidates.pop_front();
        attempt.dialing.clone()
    }

    /// Handles a failed dial. Returns the peer it was for and the next URL
    /// to try, if any.
    pub(crate) fn dial_failed(&mut self, address: &str) -> Option<(PeerId, Option<String>)> {
        let (peer, attempt) = self
            .attempts
            .iter_mut()
            .find(|(_, attempt)| attempt.dialing.as_deref() == Some(address))?;
        attempt.dialing = None;
        let next = Self::next_dial(attempt);
        Some((peer.clone(), next))
    }

    /// Returns the tracker an attempt is running through.
    pub(crate) fn tracker_of(&self, peer: &PeerId) -> Option<&PeerId> {
        self.attempts.get(peer).map(|attempt| &attempt.tracker)
    }

    pub(crate) fn connected(&mut self, peer: &PeerId) {
        self.attempts.remove(peer);
        self.backoff.remove(peer);
    }

    pub(crate) fn failed(&mut self, peer: &PeerId, policy: &RetryPolicy) {
        self.attempts.remove(peer);
        self.backoff.entry(peer.clone()).or_default().failed(policy);
    }

    pub(crate) fn cancel(&mut self, peer: &PeerId) {
        self.attempts.remove(peer);
    }

    /// Discards attempts older than `timeout`.
    pub(crate) fn expire(
        &mut self,
        now: Instant,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .attempts
            .iter()
            .filter(|(_, attempt)| now.duration_since(attempt.started) > timeout)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in &expired {
            self.failed(peer, policy);
        }
        expired
    }
}

impl OverlayNode {
    /// Starts a handshake towards `target` through `tracker`.
    pub(super) fn initiate(&mut self, target: &PeerId, tracker: &PeerId) {
        let now = Instant::now();
        if target == self.peer_id()
            || self.directory.contains(target)
            || !self.signalling.can_initiate(target, now)
        {
            return;
        }
        let sent = TrackerNode::new(&self.directory).send_relay(
            tracker,
            &self.config.peer_info,
            target,
            RtcSubType::RtcConnect,
            json!({}),
        );
        match sent {
            Ok(_) => {
                debug!(peer_id = %target, tracker = %tracker, "Initiating connection");
                self.signalling.started(target.clone(), tracker.clone(), now);
            }
            Err(e) => debug!(peer_id = %target, error = %e, "rtcConnect not sent"),
        }
    }

    pub(super) fn on_relay(&mut self, tracker: &PeerId, relay: RelayMessage) {
        let remote = relay.originator.peer_id.clone();
        if relay.target != *self.peer_id() {
            warn!(target = %relay.target, "Relay addressed to another peer");
            return;
        }
        match relay.sub_type {
            RtcSubType::RtcConnect => {
                if self.directory.contains(&remote) {
                    return;
                }
                if self.signalling.is_pending(&remote) {
                    if self.peer_id() < &remote {
                        debug!(peer_id = %remote, "Simultaneous connect, waiting for offer");
                        return;
                    }
                    debug!(peer_id = %remote, "Simultaneous connect, answering instead");
                    self.signalling.cancel(&remote);
                }
                self.send_offer(tracker, &remote, &relay.request_id);
            }
            RtcSubType::RtcOffer => {
                if !self.signalling.is_pending(&remote) {
                    debug!(peer_id = %remote, "Offer without a pending attempt");
                    return;
                }
                let Some(url) = description(&relay.data, "description") else {
                    warn!(peer_id = %remote, "Offer without a URL");
                    self.signalling.failed(&remote, &self.retry_policy);
                    return;
                };
                let answer = TrackerNode::new(&self.directory).send_relay(
                    tracker,
                    &self.config.peer_info,
                    &remote,
                    RtcSubType::RtcAnswer,
                    json!({ "connectionId": relay.request_id }),
                );
                if let Err(e) = answer {
                    debug!(peer_id = %remote, error = %e, "rtcAnswer not sent");
                }
                if let Some(address) = self.signalling.offer(&remote, url) {
                    debug!(peer_id = %remote, url = %address, "Dialing offered URL");
                    self.connector.connect(address);
                }
            }
            RtcSubType::IceCandidate => {
                let Some(url) = description(&relay.data, "candidate") else {
                    return;
                };
                if let Some(address) = self.signalling.candidate(&remote, url) {
                    debug!(peer_id = %remote, url = %address, "Dialing candidate");
                    self.connector.connect(address);
                }
            }
            RtcSubType::RtcAnswer => {
                debug!(peer_id = %remote, "Offer answered");
            }
        }
    }

    fn send_offer(&self, tracker: &PeerId, remote: &PeerId, connection_id: &str) {
        let protocol = TrackerNode::new(&self.directory);
        let mut urls = self.advertised.iter();
        let Some(first) = urls.next() else {
            return;
        };
        let offer = protocol.send_relay(
            tracker,
            &self.config.peer_info,
            remote,
            RtcSubType::RtcOffer,
            json!({ "connectionId": connection_id, "description": first }),
        );
        if let Err(e) = offer {
            debug!(peer_id = %remote, error = %e, "rtcOffer not sent");
            return;
        }
        for url in urls {
            let candidate = protocol.send_relay(
                tracker,
                &self.config.peer_info,
                remote,
                RtcSubType::IceCandidate,
                json!({ "connectionId": connection_id, "candidate": url, "mid": "0" }),
            );
            if let Err(e) = candidate {
                debug!(peer_id = %remote, error = %e, "iceCandidate not sent");
            }
        }
    }

    pub(super) fn on_relay_error(&mut self, error: &ErrorMessage) {
        match error.error_code {
            ErrorCode::RtcUnknownPeer => {
                info!(peer_id = %error.target, "Tracker does not know peer");
                self.signalling.failed(&error.target, &self.retry_policy);
            }
        }
    }

    pub(super) fn on_dial_failed(&mut self, address: &str, reason: &str) {
        let Some((peer, next)) = self.signalling.dial_failed(address) else {
            debug!(url = %address, reason = %reason, "Dial failed");
            return;
        };
        match next {
            Some(next) => {
                debug!(peer_id = %peer, failed = %address, next = %next, "Trying next candidate");
                self.connector.connect(next);
            }
            None => {
                let tracker = self.signalling.tracker_of(&peer).cloned();
                warn!(
                    peer_id = %peer,
                    tracker = ?tracker,
                    reason = %reason,
                    "Could not reach peer"
                );
                self.signalling.failed(&peer, &self.retry_policy);
            }
        }
    }
}

fn description(data: &Value, field: &str) -> Option<String> {
    data.get(field).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    #[test]
    fn offer_then_candidates_are_dialed_in_order() {
        let mut signalling = Signalling::default();
        let now = Instant::now();
        let peer = PeerId::new("b");
        signalling.started(peer.clone(), PeerId::new("t"), now);
        assert!(!signalling.can_initiate(&peer, now));

        assert_eq!(signalling.offer(&peer, "ws://b:1".into()), Some("ws://b:1".into()));
        assert_eq!(signalling.candidate(&peer, "ws://b:2".into()), None);
        assert_eq!(
            signalling.dial_failed("ws://b:1"),
            Some((peer.clone(), Some("ws://b:2".into())))
        );
        assert_eq!(signalling.dial_failed("ws://b:2"), Some((peer.clone(), None)));
        assert_eq!(signalling.dial_failed("ws://unknown"), None);
    }

    #[test]
    fn failure_backs_off_and_success_resets() {
        let mut signalling = Signalling::default();
        let now = Instant::now();
        let peer = PeerId::new("b");
        signalling.started(peer.clone(), PeerId::new("t"), now);
        signalling.failed(&peer, &policy());
        assert!(!signalling.is_pending(&peer));
        assert!(!signalling.can_initiate(&peer, now));
        assert!(signalling.can_initiate(&peer, now + Duration::from_secs(30)));

        signalling.connected(&peer);
        assert!(signalling.can_initiate(&peer, now));
    }

    #[test]
    fn stale_attempts_expire() {
        let mut signalling = Signalling::default();
        let now = Instant::now();
        signalling.started(PeerId::new("b"), PeerId::new("t"), now);
        assert!(signalling
            .expire(now + Duration::from_secs(1), Duration::from_secs(5), &policy())
            .is_empty());
        let expired = signalling.expire(now + Duration::from_secs(6), Duration::from_secs(5), &policy());
        assert_eq!(expired, vec![PeerId::new("b")]);
        assert!(!signalling.is_pending(&PeerId::new("b")));
    }

    #[test]
    fn offers_without_attempt_are_ignored() {
        let mut signalling = Signalling::default();
        assert_eq!(signalling.offer(&PeerId::new("x"), "ws://x".into()), None);
    }
}
