use std::collections::BTreeMap;
use std::sync::Arc;

use shrike_core::{DatumRef, HashRange, KeyRange, QueryError, RgetItem, Sorting, StoreKey};
use shrike_ranges::ReadHints;

use crate::{GeoPredicate, Transform};

/// Default per-shard scan allowance when the batch spec imposes no
/// element cap of its own.
pub const DEFAULT_SHARD_BATCH_ROWS: usize = 1024;

/// A physical read request. Tagged union over the read kinds the
/// pipeline issues.
#[derive(Debug)]
pub enum ReadRequest {
    Range(RangeRead),
    Point(PointRead),
    Intersecting(IntersectingRead),
}

impl ReadRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ReadRequest::Range(_) => "range",
            ReadRequest::Point(_) => "point",
            ReadRequest::Intersecting(_) => "intersecting",
        }
    }
}

/// A range read over the primary key space, or over a secondary index's
/// encoded key space when `sindex` is set.
#[derive(Debug)]
pub struct RangeRead {
    /// The key range to scan. Interpreted in the traversal key space:
    /// primary keys, or encoded index keys for a sindex read.
    pub region: KeyRange,
    /// Per-shard resume hints. `None` on the first carve of a logical
    /// read, before any per-shard frontier exists; shards missing from a
    /// present map are not read at all.
    pub hints: Option<ReadHints>,
    pub sorting: Sorting,
    /// Traverse this secondary index instead of the primary key space.
    pub sindex: Option<String>,
    /// Shard-side transform pipeline, applied in order.
    pub transforms: Vec<Transform>,
    /// Shard-side terminal accumulation; rows are consumed, not
    /// returned.
    pub terminal: Option<Terminal>,
    /// Raw rows each shard may scan this round-trip.
    pub batch_rows: usize,
    /// Request per-shard changefeed stamps with the response.
    pub stamp: bool,
}

/// A point read over explicit primary keys.
#[derive(Debug)]
pub struct PointRead {
    pub keys: Vec<StoreKey>,
    pub stamp: bool,
}

/// A geo-intersection read over a geo-indexed sindex. Always unordered;
/// the geometry oracle is the real filter.
pub struct IntersectingRead {
    pub sindex: String,
    pub geometry: Arc<dyn GeoPredicate>,
    pub transforms: Vec<Transform>,
    pub terminal: Option<Terminal>,
    pub batch_rows: usize,
    pub stamp: bool,
    /// Bound on the processed set, from the configured array size limit.
    pub processed_limit: usize,
}

impl std::fmt::Debug for IntersectingRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntersectingRead")
            .field("sindex", &self.sindex)
            .field("batch_rows", &self.batch_rows)
            .field("stamp", &self.stamp)
            .finish_non_exhaustive()
    }
}

/// A terminal accumulator pushed down with a read.
#[derive(Clone, Debug)]
pub enum Terminal {
    Count,
    /// Sum of a numeric field.
    Sum(String),
    /// Average of a numeric field.
    Avg(String),
    /// Collect rows into an array.
    Collect,
}

/// A terminal accumulator's state, mergeable across shards.
#[derive(Clone, Debug, PartialEq)]
pub enum TerminalResult {
    Count(u64),
    Sum(f64),
    Avg { sum: f64, count: u64 },
    Collect(Vec<DatumRef>),
}

impl TerminalResult {
    pub fn new(terminal: &Terminal) -> Self {
        match terminal {
            Terminal::Count => TerminalResult::Count(0),
            Terminal::Sum(_) => TerminalResult::Sum(0.0),
            Terminal::Avg(_) => TerminalResult::Avg { sum: 0.0, count: 0 },
            Terminal::Collect => TerminalResult::Collect(Vec::new()),
        }
    }

    /// Fold one row into the accumulator.
    pub fn note(
        &mut self,
        terminal: &Terminal,
        datum: &DatumRef,
    ) -> error_stack::Result<(), QueryError> {
        match (self, terminal) {
            (TerminalResult::Count(n), Terminal::Count) => *n += 1,
            (TerminalResult::Sum(sum), Terminal::Sum(field)) => {
                *sum += numeric_field(datum, field)?;
            }
            (TerminalResult::Avg { sum, count }, Terminal::Avg(field)) => {
                *sum += numeric_field(datum, field)?;
                *count += 1;
            }
            (TerminalResult::Collect(rows), Terminal::Collect) => rows.push(datum.clone()),
            _ => {
                error_stack::bail!(QueryError::logic("terminal/accumulator mismatch"))
            }
        }
        Ok(())
    }

    /// Merge another shard's accumulator into this one.
    pub fn merge(&mut self, other: TerminalResult) -> error_stack::Result<(), QueryError> {
        match (self, other) {
            (TerminalResult::Count(a), TerminalResult::Count(b)) => *a += b,
            (TerminalResult::Sum(a), TerminalResult::Sum(b)) => *a += b,
            (
                TerminalResult::Avg { sum, count },
                TerminalResult::Avg { sum: s, count: c },
            ) => {
                *sum += s;
                *count += c;
            }
            (TerminalResult::Collect(a), TerminalResult::Collect(mut b)) => a.append(&mut b),
            _ => error_stack::bail!(QueryError::logic("terminal/accumulator mismatch")),
        }
        Ok(())
    }

    /// Collapse the accumulator into a datum for the caller.
    pub fn into_datum(self) -> DatumRef {
        use shrike_core::Datum;
        match self {
            TerminalResult::Count(n) => Datum::number(n as f64),
            TerminalResult::Sum(sum) => Datum::number(sum),
            TerminalResult::Avg { sum, count } => {
                if count == 0 {
                    Datum::null()
                } else {
                    Datum::number(sum / count as f64)
                }
            }
            TerminalResult::Collect(rows) => Datum::array(rows),
        }
    }
}

fn numeric_field(datum: &DatumRef, field: &str) -> error_stack::Result<f64, QueryError> {
    datum
        .get_field(field)
        .and_then(|value| value.as_number())
        .ok_or_else(|| {
            error_stack::report!(QueryError::logic(format!(
                "field `{field}` is not a number"
            )))
        })
}

/// One hash-shard's slice of a read response.
#[derive(Debug)]
pub struct ShardStream {
    /// The region this shard serves.
    pub region: KeyRange,
    pub hash_range: HashRange,
    /// Rows, in traversal key order for the requested direction.
    pub items: Vec<RgetItem>,
    /// The furthest traversal key the shard scanned this round, whether
    /// or not the row under it survived the transforms. `None` means the
    /// shard scanned to the end of its requested range.
    pub last_key: Option<StoreKey>,
}

/// Per-shard changefeed stamps: monotonic sequence numbers.
pub type ShardStamps = BTreeMap<HashRange, u64>;

/// A raw, per-shard read response, before unsharding.
#[derive(Debug)]
pub struct ReadResponse {
    pub shards: Vec<ShardStream>,
    /// Present iff the request asked for stamps.
    pub stamps: Option<ShardStamps>,
    /// Per-shard terminal accumulators, when the read carried a
    /// terminal.
    pub terminals: Vec<TerminalResult>,
    /// The sharding epoch the response was served under. A logical read
    /// must see a single epoch end to end.
    pub epoch: u64,
}
