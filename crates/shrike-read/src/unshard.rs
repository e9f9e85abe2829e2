use std::collections::{BTreeMap, VecDeque};

use smallvec::SmallVec;

use shrike_core::{sanity_check, HashRange, RgetItem, Sorting, StoreKey};
use shrike_ranges::{ActiveRanges, RangeState};
use shrike_store::ShardStream;

/// A transient merge cursor over one hash-shard's buffered rows followed
/// by the rows it returned this round.
struct Pseudoshard {
    hash_range: HashRange,
    /// Rows with their merge keys, cached-first.
    queue: VecDeque<(StoreKey, RgetItem)>,
    prev_cache_len: usize,
    got_fresh: bool,
}

impl Pseudoshard {
    fn head_key(&self) -> Option<&StoreKey> {
        self.queue.front().map(|(key, _)| key)
    }
}

/// Which buffered rows are safe to emit this round.
enum EmitBound {
    All,
    Nothing,
    /// Ascending: rows strictly below the smallest live left edge.
    Below(StoreKey),
    /// Descending: rows at or above the largest live right edge.
    AtOrAbove(StoreKey),
}

/// The safe frontier across all live shards.
///
/// A live shard with frontier `[left, right)` can still produce rows
/// anywhere in it: ascending traversals may emit only below the
/// smallest live `left`, descending ones only at or above the largest
/// live right edge (an unbounded right edge blocks everything).
fn compute_emit_bound(active_ranges: &ActiveRanges, sorting: Sorting) -> EmitBound {
    if !sorting.is_ordered() {
        return EmitBound::All;
    }
    let live = active_ranges
        .iter()
        .map(|(_, _, shard)| shard.key_range())
        .filter(|range| !range.is_empty());

    if sorting.is_descending() {
        let mut bound: Option<StoreKey> = None;
        for range in live {
            match range.right_key() {
                None => return EmitBound::Nothing,
                Some(right) => {
                    bound = Some(bound.map_or_else(|| right.clone(), |b| b.max(right.clone())));
                }
            }
        }
        bound.map_or(EmitBound::All, EmitBound::AtOrAbove)
    } else {
        live.map(|range| range.left.clone())
            .min()
            .map_or(EmitBound::All, EmitBound::Below)
    }
}

/// Merge one raw response into a single row sequence, advancing the
/// active ranges in place.
///
/// Rows each shard returned beyond the collective safe frontier are
/// pushed back into that shard's cache; a shard that buffered rows
/// without the merge consuming any becomes saturated and is left out of
/// reads until its buffer drains.
pub(crate) fn unshard_response(
    active_ranges: &mut ActiveRanges,
    sorting: Sorting,
    shards: Vec<ShardStream>,
) -> Vec<RgetItem> {
    let mut fresh: BTreeMap<HashRange, ShardStream> = BTreeMap::new();
    for stream in shards {
        let prev = fresh.insert(stream.hash_range, stream);
        sanity_check!(prev.is_none(), "duplicate hash shard in response");
    }

    // Pass 1: take each shard's cache, advance its frontier past what it
    // scanned this round, and set up its merge cursor. Shard counts are
    // small, so the scratch lives inline.
    let mut pseudoshards: SmallVec<[Pseudoshard; 4]> = SmallVec::new();
    for (_, hash_range, shard) in active_ranges.iter_mut() {
        let stream = fresh.remove(hash_range);
        if shard.state() == RangeState::Exhausted {
            sanity_check!(
                stream
                    .as_ref()
                    .map_or(true, |s| s.items.is_empty() && s.last_key.is_none()),
                "exhausted shard produced data"
            );
            continue;
        }

        let prev_cache_len = shard.cache_len();
        let mut queue: VecDeque<(StoreKey, RgetItem)> = shard
            .take_cache()
            .into_iter()
            .map(|item| (item.merge_key(), item))
            .collect();

        let mut got_fresh = false;
        if let Some(stream) = stream {
            got_fresh = !stream.items.is_empty();
            queue.extend(stream.items.into_iter().map(|item| (item.merge_key(), item)));
            match &stream.last_key {
                // The shard stopped early: its frontier moves just past
                // the furthest key it scanned.
                Some(last_key) => shard.advance_past(last_key, sorting),
                // The shard scanned to the end of its requested range.
                None => shard.exhaust_range(),
            }
        }

        pseudoshards.push(Pseudoshard {
            hash_range: *hash_range,
            queue,
            prev_cache_len,
            got_fresh,
        });
    }
    sanity_check!(fresh.is_empty(), "response contains an unknown shard");

    // Pass 2: the collective safe frontier. A row can only be emitted if
    // no live shard can still produce a row that sorts before it.
    let emit_bound = compute_emit_bound(active_ranges, sorting);
    let admits = |key: &StoreKey| match &emit_bound {
        EmitBound::All => true,
        EmitBound::Nothing => false,
        EmitBound::Below(bound) => key < bound,
        EmitBound::AtOrAbove(bound) => key >= bound,
    };

    // Pass 3: the merge itself.
    let mut out = Vec::new();
    if sorting.is_ordered() {
        // Repeatedly pop the best admissible head across shards. Ties go
        // to the first-encountered pseudoshard; that is stable but not a
        // guaranteed order across shard topologies.
        loop {
            let mut best: Option<usize> = None;
            for (index, ps) in pseudoshards.iter().enumerate() {
                let Some(key) = ps.head_key() else { continue };
                let better = match best {
                    None => true,
                    Some(best_index) => {
                        let best_key = pseudoshards[best_index].head_key().expect("head");
                        sorting.orient(key.cmp(best_key)).is_lt()
                    }
                };
                if better {
                    best = Some(index);
                }
            }
            let Some(best) = best else { break };
            let Some(key) = pseudoshards[best].head_key() else { break };
            if !admits(key) {
                break;
            }
            let (_, item) = pseudoshards[best].queue.pop_front().expect("non-empty");
            out.push(item);
        }
    } else {
        // Round-robin one row per live shard per pass: interleaving for
        // fairness across shards, no order guarantee.
        let mut live: Vec<usize> = (0..pseudoshards.len()).collect();
        while !live.is_empty() {
            live.retain(|&index| match pseudoshards[index].queue.pop_front() {
                Some((_, item)) => {
                    out.push(item);
                    true
                }
                None => false,
            });
        }
    }

    // Pass 4: push unpopped rows back and recompute each shard's state.
    let mut leftovers: BTreeMap<HashRange, Pseudoshard> = pseudoshards
        .into_iter()
        .map(|ps| (ps.hash_range, ps))
        .collect();
    let mut made_progress = false;
    for (_, hash_range, shard) in active_ranges.iter_mut() {
        let Some(ps) = leftovers.remove(hash_range) else { continue };
        made_progress |= ps.got_fresh || !ps.queue.is_empty();
        shard.finish_round(
            ps.queue.into_iter().map(|(_, item)| item).collect(),
            ps.prev_cache_len,
            ps.got_fresh,
        );
    }

    // The pull-based caller must always make progress or correctly
    // terminate: an empty merge is only legal if the round advanced a
    // frontier or buffered rows for later, or if everything is done.
    sanity_check!(
        !out.is_empty() || made_progress || active_ranges.totally_exhausted(),
        "unshard produced nothing while shards remain active"
    );

    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use shrike_core::{Datum, KeyRange};
    use shrike_ranges::new_active_ranges;

    use super::*;

    fn item(key: &str) -> RgetItem {
        RgetItem::new(StoreKey::from(key), Datum::string(key))
    }

    fn layout(n: u64) -> Vec<(KeyRange, HashRange)> {
        let step = u64::MAX / n;
        (0..n)
            .map(|i| {
                let end = if i == n - 1 { u64::MAX } else { (i + 1) * step };
                (KeyRange::universe(), HashRange::new(i * step, end))
            })
            .collect()
    }

    fn stream(
        hash_range: HashRange,
        keys: &[&str],
        last_key: Option<&str>,
    ) -> ShardStream {
        ShardStream {
            region: KeyRange::universe(),
            hash_range,
            items: keys.iter().map(|k| item(k)).collect(),
            last_key: last_key.map(StoreKey::from),
        }
    }

    #[test]
    fn test_ordered_merge_interleaves_by_key() {
        let layout = layout(2);
        let mut active = new_active_ranges(layout.clone(), &KeyRange::universe());
        let out = unshard_response(
            &mut active,
            Sorting::Ascending,
            vec![
                stream(layout[0].1, &["a", "c", "e"], None),
                stream(layout[1].1, &["b", "d"], None),
            ],
        );
        let keys: Vec<_> = out.iter().map(|i| i.key.clone()).collect();
        assert_eq!(
            keys,
            ["a", "b", "c", "d", "e"].map(StoreKey::from).to_vec()
        );
        assert!(active.totally_exhausted());
    }

    #[test]
    fn test_ordered_merge_holds_back_rows_beyond_the_frontier() {
        let layout = layout(2);
        let mut active = new_active_ranges(layout.clone(), &KeyRange::universe());
        // Shard 0 scanned far ahead (through "z"); shard 1 only through
        // "c". Rows beyond "c" cannot be emitted yet: shard 1 may still
        // produce "d".
        let out = unshard_response(
            &mut active,
            Sorting::Ascending,
            vec![
                stream(layout[0].1, &["a", "m", "z"], Some("z")),
                stream(layout[1].1, &["b", "c"], Some("c")),
            ],
        );
        let keys: Vec<_> = out.iter().map(|i| i.key.clone()).collect();
        assert_eq!(keys, ["a", "b", "c"].map(StoreKey::from).to_vec());

        // The held-back rows come out once shard 1 catches up.
        let out = unshard_response(
            &mut active,
            Sorting::Ascending,
            vec![stream(layout[1].1, &["d"], None)],
        );
        let keys: Vec<_> = out.iter().map(|i| i.key.clone()).collect();
        assert_eq!(keys, ["d", "m", "z"].map(StoreKey::from).to_vec());
    }

    #[test]
    fn test_shard_ahead_of_the_merge_saturates() {
        let layout = layout(2);
        let mut active = new_active_ranges(layout.clone(), &KeyRange::universe());
        unshard_response(
            &mut active,
            Sorting::Ascending,
            vec![
                stream(layout[0].1, &["m", "n", "o"], Some("o")),
                stream(layout[1].1, &["a"], Some("a")),
            ],
        );
        // Shard 0's rows all sort beyond shard 1's frontier: buffered.
        // A further round with nothing new from shard 0 leaves its
        // buffer untouched, so it saturates.
        unshard_response(
            &mut active,
            Sorting::Ascending,
            vec![stream(layout[1].1, &["b"], Some("b"))],
        );
        let states: Vec<_> = active.iter().map(|(_, _, s)| s.state()).collect();
        assert_eq!(states, vec![RangeState::Saturated, RangeState::Active]);

        // Once the other shard's frontier passes its buffer, the rows
        // drain and the shard re-activates.
        let out = unshard_response(
            &mut active,
            Sorting::Ascending,
            vec![stream(layout[1].1, &[], None)],
        );
        let keys: Vec<_> = out.iter().map(|i| i.key.clone()).collect();
        assert_eq!(keys, ["m", "n", "o"].map(StoreKey::from).to_vec());
        let states: Vec<_> = active.iter().map(|(_, _, s)| s.state()).collect();
        assert_eq!(states, vec![RangeState::Active, RangeState::Exhausted]);
    }

    #[test]
    fn test_unordered_merge_round_robins() {
        let layout = layout(2);
        let mut active = new_active_ranges(layout.clone(), &KeyRange::universe());
        let out = unshard_response(
            &mut active,
            Sorting::Unordered,
            vec![
                stream(layout[0].1, &["a", "b", "c"], None),
                stream(layout[1].1, &["x", "y", "z"], None),
            ],
        );
        let keys: Vec<_> = out.iter().map(|i| i.key.clone()).collect();
        // One row per shard per pass, not one stream drained first.
        assert_eq!(
            keys,
            ["a", "x", "b", "y", "c", "z"].map(StoreKey::from).to_vec()
        );
    }

    #[test]
    fn test_descending_merge() {
        let layout = layout(2);
        let mut active = new_active_ranges(layout.clone(), &KeyRange::universe());
        let out = unshard_response(
            &mut active,
            Sorting::Descending,
            vec![
                stream(layout[0].1, &["e", "c"], None),
                stream(layout[1].1, &["d", "b"], None),
            ],
        );
        let keys: Vec<_> = out.iter().map(|i| i.key.clone()).collect();
        assert_eq!(keys, ["e", "d", "c", "b"].map(StoreKey::from).to_vec());
    }

    proptest::proptest! {
        /// One full round over any pair of disjoint sorted shard
        /// streams merges to exactly the sorted union.
        #[test]
        fn test_ordered_merge_equals_sorted_union(
            keys in proptest::collection::btree_set("[a-z]{1,5}", 0..40),
        ) {
            let layout = layout(2);
            let mut active = new_active_ranges(layout.clone(), &KeyRange::universe());
            let (even, odd): (Vec<_>, Vec<_>) = keys
                .iter()
                .enumerate()
                .partition(|(index, _)| index % 2 == 0);
            let to_stream = |hash_range, keys: Vec<(usize, &String)>| ShardStream {
                region: KeyRange::universe(),
                hash_range,
                items: keys.iter().map(|(_, k)| item(k)).collect(),
                last_key: None,
            };
            let out = unshard_response(
                &mut active,
                Sorting::Ascending,
                vec![
                    to_stream(layout[0].1, even),
                    to_stream(layout[1].1, odd),
                ],
            );
            let merged: Vec<_> = out.iter().map(|i| i.key.clone()).collect();
            let expected: Vec<_> = keys.iter().map(|k| StoreKey::from(k.as_str())).collect();
            prop_assert_eq!(merged, expected);
            prop_assert!(active.totally_exhausted());
        }
    }

    #[test]
    #[should_panic(expected = "produced nothing")]
    fn test_empty_round_with_active_shards_is_a_bug() {
        let layout = layout(1);
        let mut active = new_active_ranges(layout.clone(), &KeyRange::universe());
        // First round exhausts nothing and returns nothing: the shard
        // reported no scan progress at all, which must never happen.
        unshard_response(
            &mut active,
            Sorting::Ascending,
            vec![],
        );
    }
}
