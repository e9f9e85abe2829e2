use std::collections::VecDeque;

use shrike_core::{sanity_check, KeyRange, RgetItem, Sorting, StoreKey};

/// The traversal state of one `(region, hash-shard)` pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RangeState {
    /// The shard has unread key space; the next read includes it.
    Active,
    /// The shard's last batch buffered more rows than the merge used.
    /// Reading more from it would only grow the buffer, so it is left
    /// out of reads until the buffer drains.
    Saturated,
    /// Nothing left: no unread key space and no buffered rows.
    /// Terminal.
    Exhausted,
}

/// Pure transition function for [`RangeState`].
///
/// * `Exhausted` requires an empty cache and an empty key range.
/// * `Saturated` requires a non-empty cache that neither received fresh
///   rows nor shrank this round.
pub fn next_state(
    key_range_empty: bool,
    cache_len: usize,
    got_fresh: bool,
    cache_shrank: bool,
) -> RangeState {
    if key_range_empty && cache_len == 0 {
        RangeState::Exhausted
    } else if cache_len > 0 && !got_fresh && !cache_shrank {
        RangeState::Saturated
    } else {
        RangeState::Active
    }
}

/// One hash-shard's traversal frontier plus its buffer of fetched but
/// not yet merged rows.
#[derive(Debug)]
pub struct HashRangeWithCache {
    key_range: KeyRange,
    cache: VecDeque<RgetItem>,
    state: RangeState,
}

impl HashRangeWithCache {
    pub fn new(key_range: KeyRange) -> Self {
        Self {
            key_range,
            cache: VecDeque::new(),
            state: RangeState::Active,
        }
    }

    pub fn state(&self) -> RangeState {
        self.state
    }

    pub fn key_range(&self) -> &KeyRange {
        &self.key_range
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Take the buffered rows for merging. The caller must complete the
    /// round with [`finish_round`](Self::finish_round).
    pub fn take_cache(&mut self) -> VecDeque<RgetItem> {
        std::mem::take(&mut self.cache)
    }

    /// Advance the frontier past `last_key`, the furthest key the shard
    /// scanned this round. Ranges only ever shrink; a frontier already
    /// moved further (for example by a key-set restriction) stays put.
    pub fn advance_past(&mut self, last_key: &StoreKey, sorting: Sorting) {
        sanity_check!(
            self.state != RangeState::Exhausted,
            "advanced an exhausted shard range"
        );
        if sorting.is_descending() {
            let right = shrike_core::KeyBound::Open(last_key.clone());
            if right < self.key_range.right {
                self.key_range.right = right;
            }
        } else {
            let left = last_key.successor();
            if left > self.key_range.left {
                self.key_range.left = left;
            }
        }
    }

    /// The shard scanned to the end of its requested range: no unread
    /// key space remains.
    pub fn exhaust_range(&mut self) {
        sanity_check!(
            self.state != RangeState::Exhausted,
            "advanced an exhausted shard range"
        );
        self.key_range = KeyRange::empty_at(self.key_range.left.clone());
    }

    /// Complete an unshard round: store the rows the merge did not use
    /// and recompute the state.
    ///
    /// `prev_cache_len` is the buffer length before the round (from
    /// before [`take_cache`](Self::take_cache)); `got_fresh` is whether
    /// the shard returned any new rows this round.
    pub fn finish_round(
        &mut self,
        leftovers: VecDeque<RgetItem>,
        prev_cache_len: usize,
        got_fresh: bool,
    ) {
        let state = next_state(
            self.key_range.is_empty(),
            leftovers.len(),
            got_fresh,
            leftovers.len() < prev_cache_len,
        );
        self.cache = leftovers;
        self.state = state;
    }

    /// Restrict the frontier to the span of an explicit key set, so a
    /// point-get over scattered keys does not over-read.
    pub fn clamp_to_span(&mut self, span: Option<KeyRange>) {
        match span {
            Some(span) => self.key_range = self.key_range.intersect(&span),
            None => self.exhaust_range(),
        }
        if self.key_range.is_empty() && self.cache.is_empty() {
            self.state = RangeState::Exhausted;
        }
    }
}
