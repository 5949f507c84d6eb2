use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::hawk::AuthError;

/// Bounded replay cache over `(principal, nonce)` pairs.
///
/// Entries live for the configured TTL, which must exceed twice the Hawk
/// timestamp skew so no request that passed the skew check can be
/// replayed after its entry expires. Entries are never refreshed after
/// insertion, so insertion order doubles as LRU order and eviction pops
/// from the front of the queue.
pub struct NonceCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    capacity: usize,
}

struct Inner {
    seen: HashMap<(String, String), Instant>,
    order: VecDeque<(String, String)>,
}

impl NonceCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            ttl,
            capacity,
        }
    }

    /// Atomically records the pair, rejecting it if already present.
    pub fn check_and_insert(&self, principal: &str, nonce: &str) -> Result<(), AuthError> {
        self.check_and_insert_at(principal, nonce, Instant::now())
    }

    fn check_and_insert_at(
        &self,
        principal: &str,
        nonce: &str,
        now: Instant,
    ) -> Result<(), AuthError> {
        let mut inner = self.inner.lock();

        // Expired entries sit at the front of the queue.
        loop {
            let expired = match inner.order.front() {
                Some(key) => inner
                    .seen
                    .get(key)
                    .is_none_or(|at| now.duration_since(*at) >= self.ttl),
                None => break,
            };
            if !expired {
                break;
            }
            if let Some(key) = inner.order.pop_front() {
                inner.seen.remove(&key);
            }
        }

        let key = (principal.to_string(), nonce.to_string());
        if inner.seen.contains_key(&key) {
            return Err(AuthError::Replay);
        }

        if inner.seen.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }

        inner.seen.insert(key.clone(), now);
        inner.order.push_back(key);
        Ok(())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }
}
