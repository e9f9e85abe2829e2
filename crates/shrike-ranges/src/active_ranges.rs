use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use shrike_core::{
    key_hash, sanity_check, HashRange, KeyBound, KeyRange, Sorting, StoreKey,
};

use crate::{HashRangeWithCache, RangeState};

/// The per-hash-shard frontiers within one region.
#[derive(Debug, Default)]
pub struct HashRanges {
    pub hash_ranges: BTreeMap<HashRange, HashRangeWithCache>,
}

impl HashRanges {
    pub fn totally_exhausted(&self) -> bool {
        self.hash_ranges
            .values()
            .all(|shard| shard.state() == RangeState::Exhausted)
    }
}

/// Where to resume each hash-shard's next shard-local read.
///
/// Ascending traversals resume from an inclusive start key; descending
/// traversals resume below an exclusive upper key, with `None` meaning
/// "from the top of the region". Shards without an entry are not read.
pub type ReadHints = BTreeMap<HashRange, Option<StoreKey>>;

/// The frontier of unread key space per `(region, hash-shard)` pair for
/// one in-progress unsharded traversal.
///
/// Created lazily from the first response, mutated in place by each
/// unshard round, dropped when every shard is exhausted.
#[derive(Debug, Default)]
pub struct ActiveRanges {
    pub ranges: BTreeMap<KeyRange, HashRanges>,
}

impl ActiveRanges {
    pub fn totally_exhausted(&self) -> bool {
        self.ranges.values().all(HashRanges::totally_exhausted)
    }

    pub fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (&KeyRange, &HashRange, &mut HashRangeWithCache)> {
        self.ranges.iter_mut().flat_map(|(region, shards)| {
            shards
                .hash_ranges
                .iter_mut()
                .map(move |(hash_range, shard)| (region, hash_range, shard))
        })
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&KeyRange, &HashRange, &HashRangeWithCache)> {
        self.ranges.iter().flat_map(|(region, shards)| {
            shards
                .hash_ranges
                .iter()
                .map(move |(hash_range, shard)| (region, hash_range, shard))
        })
    }

    /// Restrict every shard's frontier to the span of an explicit key
    /// set, so a point-get over scattered keys does not over-read.
    pub fn restrict_to_keys(&mut self, keys: &BTreeSet<StoreKey>) {
        for (region, hash_range, shard) in self.ranges.iter_mut().flat_map(|(r, s)| {
            s.hash_ranges.iter_mut().map(move |(h, shard)| (r, h, shard))
        }) {
            let in_shard = keys
                .iter()
                .filter(|key| {
                    hash_range.contains(key_hash(key))
                        && region.contains(key)
                        && shard.key_range().contains(key)
                })
                .collect_vec();
            let span = match (in_shard.first(), in_shard.last()) {
                (Some(first), Some(last)) => Some(KeyRange::new(
                    (*first).clone(),
                    KeyBound::Open(last.successor()),
                )),
                _ => None,
            };
            shard.clamp_to_span(span);
        }
    }
}

/// Build the tracker from the first response's per-shard layout.
///
/// Each shard's initial frontier is its region clipped to the original
/// logical range.
pub fn new_active_ranges(
    shard_layout: impl IntoIterator<Item = (KeyRange, HashRange)>,
    original_range: &KeyRange,
) -> ActiveRanges {
    let mut ranges: BTreeMap<KeyRange, HashRanges> = BTreeMap::new();
    for (region, hash_range) in shard_layout {
        let frontier = region.intersect(original_range);
        let prev = ranges
            .entry(region)
            .or_default()
            .hash_ranges
            .insert(hash_range, HashRangeWithCache::new(frontier));
        sanity_check!(prev.is_none(), "duplicate hash shard in response");
    }
    ActiveRanges { ranges }
}

/// The bounding key range of all ACTIVE shards: the region of the next
/// physical read.
///
/// Saturated shards are excluded on purpose (their buffers must drain
/// first) and exhausted shards have nothing left; at least one shard
/// must be active, because saturated shards re-activate as their
/// buffers drain and exhaustion is only reached through empty frontiers.
pub fn active_ranges_to_range(active_ranges: &ActiveRanges) -> KeyRange {
    let mut bound: Option<KeyRange> = None;
    for (_, _, shard) in active_ranges.iter() {
        if shard.state() != RangeState::Active {
            continue;
        }
        let range = shard.key_range();
        bound = Some(match bound {
            None => range.clone(),
            Some(acc) => KeyRange {
                left: acc.left.min(range.left.clone()),
                right: match (acc.right, range.right.clone()) {
                    (KeyBound::Unbounded, _) | (_, KeyBound::Unbounded) => KeyBound::Unbounded,
                    (KeyBound::Open(a), KeyBound::Open(b)) => KeyBound::Open(a.max(b)),
                },
            },
        });
    }
    match bound {
        Some(bound) => bound,
        None => {
            sanity_check!(false, "no active shard remaining while rows are expected");
            unreachable!()
        }
    }
}

/// Per-shard resume hints for the next physical read, oriented by sort
/// direction. Only active shards get an entry.
pub fn active_ranges_to_hints(active_ranges: &ActiveRanges, sorting: Sorting) -> ReadHints {
    let mut hints = ReadHints::new();
    for (_, hash_range, shard) in active_ranges.iter() {
        if shard.state() != RangeState::Active {
            continue;
        }
        let hint = if sorting.is_descending() {
            shard.key_range().right_key().cloned()
        } else {
            Some(shard.key_range().left.clone())
        };
        let prev = hints.insert(*hash_range, hint);
        sanity_check!(prev.is_none(), "hash shard appears in two regions");
    }
    hints
}
