//! rotary_gate/src/lru.rs
//! Ordered map tracking least-recently-used upstream indices (spec §4.6).
//!
//! Ported from the teacher's preference for `BTreeMap`-backed ordering
//! (see `dashmap`/`lazy_static` globals elsewhere in the teacher crate) but
//! built from a monotonic sequence counter rather than wall-clock
//! timestamps, so `mark_used`/`remove`/`oldest` are all O(log n). `position`
//! remains a linear scan of the sequence map, bounded by `max_active_proxies`
//! (see SPEC_FULL.md §4.6).

use std::collections::BTreeMap;
use std::collections::HashMap;

#[derive(Default)]
pub struct LruTracker {
    /// sequence -> upstream index, ordered oldest (smallest seq) first.
    order: BTreeMap<u64, usize>,
    /// upstream index -> its current sequence, for O(log n) removal.
    seq_of: HashMap<usize, u64>,
    next_seq: u64,
}

impl LruTracker {
    pub fn new() -> Self {
        LruTracker::default()
    }

    /// Removes `i` if tracked, then reinserts it with a fresh sequence so it
    /// becomes the most-recently-used entry.
    pub fn mark_used(&mut self, i: usize) {
        self.remove(i);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, i);
        self.seq_of.insert(i, seq);
    }

    pub fn remove(&mut self, i: usize) {
        if let Some(seq) = self.seq_of.remove(&i) {
            self.order.remove(&seq);
        }
    }

    /// The least-recently-used index, or `None` if empty.
    pub fn oldest(&self) -> Option<usize> {
        self.order.values().next().copied()
    }

    /// 0-based rank of `i` from the oldest end, or `-1` if untracked.
    pub fn position(&self, i: usize) -> i64 {
        let Some(&seq) = self.seq_of.get(&i) else {
            return -1;
        };
        self.order.range(..seq).count() as i64
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
