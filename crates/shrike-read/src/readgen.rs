use std::collections::BTreeSet;
use std::sync::Arc;

use shrike_batch::BatchSpec;
use shrike_core::{Datum, KeyBound, KeyRange, QueryOptions, RgetItem, Sorting, StoreKey};
use shrike_ranges::{active_ranges_to_hints, active_ranges_to_range, ActiveRanges};
use shrike_store::{
    GeoPredicate, IntersectingRead, RangeRead, ReadRequest, Terminal, Transform,
    DEFAULT_SHARD_BATCH_ROWS,
};

/// Query shape shared by every read strategy.
#[derive(Debug)]
struct ReadGenCommon {
    /// The original logical range, in the traversal key space.
    original_range: KeyRange,
    sorting: Sorting,
    /// Transform stages pushed down into shard-local reads.
    transforms: Vec<Transform>,
    /// Request changefeed stamps with every read.
    stamp: bool,
}

/// Primary-key traversal.
#[derive(Debug)]
pub struct PrimaryReadGen {
    common: ReadGenCommon,
    /// For point-style `get_all` reads: the explicit key set, used to
    /// restrict active ranges so scattered keys do not over-read.
    keys: Option<BTreeSet<StoreKey>>,
}

/// Secondary-index traversal. Ranges and hints live in the encoded
/// index key space.
#[derive(Debug)]
pub struct SindexReadGen {
    common: ReadGenCommon,
    sindex: String,
}

/// Geo-intersection traversal. Always unordered over the whole index;
/// the geometry oracle is the real filter.
pub struct IntersectingReadGen {
    common: ReadGenCommon,
    sindex: String,
    geometry: Arc<dyn GeoPredicate>,
}

/// The strategy producing physical reads for one logical cursor.
///
/// A closed set: primary, secondary-index, or geo-intersection
/// traversal. Owned by the response reader for the cursor's lifetime.
pub enum ReadGen {
    Primary(PrimaryReadGen),
    Sindex(SindexReadGen),
    Intersecting(IntersectingReadGen),
}

impl ReadGen {
    pub fn primary(range: KeyRange, sorting: Sorting, stamp: bool) -> Self {
        ReadGen::Primary(PrimaryReadGen {
            common: ReadGenCommon {
                original_range: range,
                sorting,
                transforms: Vec::new(),
                stamp,
            },
            keys: None,
        })
    }

    /// A `get_all`-style read over an explicit primary key set.
    pub fn primary_keys(keys: BTreeSet<StoreKey>, stamp: bool) -> Self {
        let range = match (keys.first(), keys.last()) {
            (Some(first), Some(last)) => {
                KeyRange::new(first.clone(), KeyBound::Open(last.successor()))
            }
            _ => KeyRange::empty_at(StoreKey::min()),
        };
        ReadGen::Primary(PrimaryReadGen {
            common: ReadGenCommon {
                original_range: range,
                sorting: Sorting::Unordered,
                transforms: Vec::new(),
                stamp,
            },
            keys: Some(keys),
        })
    }

    pub fn sindex(sindex: impl Into<String>, range: KeyRange, sorting: Sorting, stamp: bool) -> Self {
        ReadGen::Sindex(SindexReadGen {
            common: ReadGenCommon {
                original_range: range,
                sorting,
                transforms: Vec::new(),
                stamp,
            },
            sindex: sindex.into(),
        })
    }

    pub fn intersecting(
        sindex: impl Into<String>,
        geometry: Arc<dyn GeoPredicate>,
        stamp: bool,
    ) -> Self {
        ReadGen::Intersecting(IntersectingReadGen {
            common: ReadGenCommon {
                original_range: KeyRange::universe(),
                sorting: Sorting::Unordered,
                transforms: Vec::new(),
                stamp,
            },
            sindex: sindex.into(),
            geometry,
        })
    }

    fn common(&self) -> &ReadGenCommon {
        match self {
            ReadGen::Primary(g) => &g.common,
            ReadGen::Sindex(g) => &g.common,
            ReadGen::Intersecting(g) => &g.common,
        }
    }

    fn common_mut(&mut self) -> &mut ReadGenCommon {
        match self {
            ReadGen::Primary(g) => &mut g.common,
            ReadGen::Sindex(g) => &mut g.common,
            ReadGen::Intersecting(g) => &mut g.common,
        }
    }

    pub fn sorting(&self) -> Sorting {
        self.common().sorting
    }

    pub fn original_range(&self) -> &KeyRange {
        &self.common().original_range
    }

    pub fn stamp(&self) -> bool {
        self.common().stamp
    }

    /// Push a transform stage down into shard-local reads.
    pub fn add_transform(&mut self, transform: Transform) {
        self.common_mut().transforms.push(transform);
    }

    /// Build the next physical read.
    ///
    /// On the first carve (`active_ranges` not yet known) the request
    /// covers the original logical range with no hints; afterwards it
    /// covers the bounding range of the active shards with per-shard
    /// resume hints.
    pub fn next_read(
        &self,
        active_ranges: Option<&ActiveRanges>,
        batchspec: &BatchSpec,
        options: &QueryOptions,
    ) -> ReadRequest {
        let common = self.common();
        let (region, hints) = match active_ranges {
            None => (common.original_range.clone(), None),
            Some(active) => (
                active_ranges_to_range(active),
                Some(active_ranges_to_hints(active, common.sorting)),
            ),
        };
        let batch_rows = batchspec
            .to_batcher()
            .els_left()
            .clamp(1, DEFAULT_SHARD_BATCH_ROWS);

        match self {
            ReadGen::Primary(_) => ReadRequest::Range(RangeRead {
                region,
                hints,
                sorting: common.sorting,
                sindex: None,
                transforms: common.transforms.clone(),
                terminal: None,
                batch_rows,
                stamp: common.stamp,
            }),
            ReadGen::Sindex(g) => ReadRequest::Range(RangeRead {
                region,
                hints,
                sorting: common.sorting,
                sindex: Some(g.sindex.clone()),
                transforms: common.transforms.clone(),
                terminal: None,
                batch_rows,
                stamp: common.stamp,
            }),
            ReadGen::Intersecting(g) => ReadRequest::Intersecting(IntersectingRead {
                sindex: g.sindex.clone(),
                geometry: g.geometry.clone(),
                transforms: common.transforms.clone(),
                terminal: None,
                batch_rows,
                stamp: common.stamp,
                processed_limit: options.array_size_limit,
            }),
        }
    }

    /// Build a one-shot read feeding a terminal accumulator, bypassing
    /// active-range tracking entirely.
    pub fn terminal_read(&self, terminal: Terminal, options: &QueryOptions) -> ReadRequest {
        let common = self.common();
        match self {
            ReadGen::Primary(_) | ReadGen::Sindex(_) => ReadRequest::Range(RangeRead {
                region: common.original_range.clone(),
                hints: None,
                sorting: common.sorting,
                sindex: match self {
                    ReadGen::Sindex(g) => Some(g.sindex.clone()),
                    _ => None,
                },
                transforms: common.transforms.clone(),
                terminal: Some(terminal),
                batch_rows: usize::MAX,
                stamp: common.stamp,
            }),
            ReadGen::Intersecting(g) => ReadRequest::Intersecting(IntersectingRead {
                sindex: g.sindex.clone(),
                geometry: g.geometry.clone(),
                transforms: common.transforms.clone(),
                terminal: Some(terminal),
                batch_rows: usize::MAX,
                stamp: common.stamp,
                processed_limit: options.array_size_limit,
            }),
        }
    }

    /// Restrict freshly-built active ranges to what this strategy will
    /// actually traverse.
    pub fn restrict_active_ranges(&self, active_ranges: &mut ActiveRanges) {
        if let ReadGen::Primary(g) = self {
            if let Some(keys) = &g.keys {
                active_ranges.restrict_to_keys(keys);
            }
        }
    }

    /// Post-sort freshly unsharded rows.
    ///
    /// Storage returns secondary-index rows in index-bucket order, which
    /// is not necessarily the global index value order, so ordered
    /// sindex traversals sort locally; primary and geo reads are no-ops.
    pub fn sindex_sort(&self, items: &mut [RgetItem]) {
        let ReadGen::Sindex(g) = self else { return };
        if !g.common.sorting.is_ordered() {
            return;
        }
        let sorting = g.common.sorting;
        items.sort_by(|a, b| {
            let ord = a
                .sindex_key
                .cmp(&b.sindex_key)
                .then_with(|| a.key.cmp(&b.key));
            sorting.orient(ord)
        });
    }
}

/// The encoded index key range covering `[lower, upper]` index values
/// (both inclusive; `None` leaves the side unbounded).
pub fn sindex_datum_range(lower: Option<&Datum>, upper: Option<&Datum>) -> KeyRange {
    let left = lower.map_or_else(StoreKey::min, Datum::to_sindex_key);
    let right = upper
        .and_then(|upper| upper.to_sindex_key().prefix_end())
        .map_or(KeyBound::Unbounded, KeyBound::Open);
    KeyRange::new(left, right)
}

/// The encoded index key range matching exactly the index value `value`.
pub fn sindex_value_range(value: &Datum) -> KeyRange {
    sindex_datum_range(Some(value), Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sindex_value_range_covers_appended_primary_keys() {
        let value = Datum::Number(3.0);
        let range = sindex_value_range(&value);
        let item_key = shrike_core::sindex_item_key(&value, &StoreKey::from("pk"));
        assert!(range.contains(&item_key));
        let other = shrike_core::sindex_item_key(&Datum::Number(4.0), &StoreKey::from("pk"));
        assert!(!range.contains(&other));
    }

    #[test]
    fn test_sindex_datum_range_is_inclusive_above() {
        let range = sindex_datum_range(Some(&Datum::Number(1.0)), Some(&Datum::Number(2.0)));
        let at_upper = shrike_core::sindex_item_key(&Datum::Number(2.0), &StoreKey::from("zz"));
        assert!(range.contains(&at_upper));
    }

    #[test]
    fn test_primary_keys_span() {
        let keys: BTreeSet<StoreKey> =
            [StoreKey::from("d"), StoreKey::from("m")].into_iter().collect();
        let gen = ReadGen::primary_keys(keys, false);
        assert!(gen.original_range().contains(&StoreKey::from("d")));
        assert!(gen.original_range().contains(&StoreKey::from("m")));
        assert!(!gen.original_range().contains(&StoreKey::from("n")));
    }
}
