//! Duplicate suppression for incoming application messages.
//!
//! Senders retry until acknowledged, so the same message can arrive more
//! than once. Two mechanisms keep delivery idempotent:
//!
//! - a bounded cache of recently seen `(sender, incarnation, seq)` keys with
//!   a time-to-live, and
//! - a per-sender high-water mark. Lanes deliver in order, so anything at or
//!   below the mark that is not in the cache is a late copy.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::member::MemberId;

type Key = (MemberId, u64, u64);

/// Verdict for an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Not seen before; deliver it.
    Fresh,
    /// Already delivered.
    Duplicate,
    /// Older than the newest message already delivered from this sender.
    Late,
}

#[derive(Debug)]
pub struct SeenCache {
    capacity: usize,
    ttl: Duration,
    order: VecDeque<(Key, Instant)>,
    seen: HashSet<Key>,
    high_water: HashMap<(MemberId, u64), u64>,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            order: VecDeque::new(),
            seen: HashSet::new(),
            high_water: HashMap::new(),
        }
    }

    /// Records `(sender, incarnation, seq)` and says whether to deliver it.
    pub fn accept(&mut self, sender: &MemberId, incarnation: u64, seq: u64, now: Instant) -> Acceptance {
        let key = (sender.clone(), incarnation, seq);
        if self.seen.contains(&key) {
            return Acceptance::Duplicate;
        }

        let mark = self
            .high_water
            .entry((sender.clone(), incarnation))
            .or_insert(0);
        if seq != 0 && seq <= *mark {
            return Acceptance::Late;
        }
        *mark = seq;

        if self.order.len() >= self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back((key, now));
        Acceptance::Fresh
    }

    /// Drops cache entries older than the TTL. Returns how many.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some((key, at)) = self.order.front() {
            if now.duration_since(*at) < self.ttl {
                break;
            }
            self.seen.remove(key);
            self.order.pop_front();
            expired += 1;
        }
        expired
    }

    /// Forgets every watermark for a departed sender.
    pub fn forget(&mut self, sender: &MemberId) {
        self.high_water.retain(|(id, _), _| id != sender);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
