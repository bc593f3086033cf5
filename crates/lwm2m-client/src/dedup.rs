//! Retransmission cache.
//!
//! Servers retransmit a request when its response is lost. A retransmission
//! carries the same message id on the same session and must not reach the
//! device a second time: a retransmitted Execute would run twice. The cache
//! remembers the last responses by `(peer, message_id)` and replays them.
//!
//! Bounded: once full, the oldest response is evicted.

use std::collections::{HashMap, VecDeque};

use lwm2m_proto::{PeerId, Response};

/// Responses remembered by default.
pub const DEFAULT_CAPACITY: usize = 256;

/// Recently sent responses.
#[derive(Debug)]
pub struct RetransmissionCache {
    capacity: usize,
    responses: HashMap<(PeerId, u16), Response>,
    order: VecDeque<(PeerId, u16)>,
}

impl RetransmissionCache {
    /// Cache holding up to `capacity` responses (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            responses: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Response already sent for `message_id` on `peer`.
    pub fn get(&self, peer: PeerId, message_id: u16) -> Option<&Response> {
        self.responses.get(&(peer, message_id))
    }

    /// Remember a response.
    pub fn insert(&mut self, peer: PeerId, message_id: u16, response: Response) {
        let key = (peer, message_id);
        if self.responses.insert(key, response).is_some() {
            return;
        }

        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.responses.remove(&oldest);
            }
        }
    }

    /// Drop everything remembered for a closed session.
    pub fn forget_peer(&mut self, peer: PeerId) {
        self.order.retain(|(owner, _)| *owner != peer);
        self.responses.retain(|(owner, _), _| *owner != peer);
    }

    /// Number of remembered responses.
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    /// True if nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

impl Default for RetransmissionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use lwm2m_proto::ResponseCode;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn replays_by_peer_and_message_id() {
        let mut cache = RetransmissionCache::new(4);
        cache.insert(PeerId(1), 7, Response::changed());

        assert_eq!(cache.get(PeerId(1), 7), Some(&Response::changed()));
        assert_eq!(cache.get(PeerId(1), 8), None);
        assert_eq!(cache.get(PeerId(2), 7), None);
    }

    #[test]
    fn evicts_oldest_first() {
        let mut cache = RetransmissionCache::new(2);
        cache.insert(PeerId(1), 1, Response::changed());
        cache.insert(PeerId(1), 2, Response::deleted());
        cache.insert(PeerId(1), 3, Response::empty(ResponseCode::NotFound));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(PeerId(1), 1), None);
        assert!(cache.get(PeerId(1), 3).is_some());
    }

    #[test]
    fn forgetting_a_peer_keeps_the_others() {
        let mut cache = RetransmissionCache::new(8);
        cache.insert(PeerId(1), 1, Response::changed());
        cache.insert(PeerId(2), 1, Response::changed());

        cache.forget_peer(PeerId(1));

        assert_eq!(cache.get(PeerId(1), 1), None);
        assert!(cache.get(PeerId(2), 1).is_some());
        assert_eq!(cache.len(), 1);
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(
            capacity in 1usize..16,
            keys in prop::collection::vec((0u64..4, 0u16..32), 0..64),
        ) {
            let mut cache = RetransmissionCache::new(capacity);
            for (peer, message_id) in keys {
                cache.insert(PeerId(peer), message_id, Response::changed());
                prop_assert!(cache.len() <= capacity);
                prop_assert!(cache.get(PeerId(peer), message_id).is_some());
            }
        }
    }
}
