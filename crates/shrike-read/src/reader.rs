use std::collections::VecDeque;
use std::sync::Arc;

use shrike_batch::{BatchSpec, BatchType};
use shrike_core::{sanity_check, DatumRef, QueryError, RgetItem};
use shrike_ranges::{new_active_ranges, ActiveRanges};
use shrike_store::{ReadResponse, ShardStamps, Table, Terminal, TerminalResult};

use crate::unshard::unshard_response;
use crate::{QueryContext, ReadGen};

/// Pull-based reader over one logical range read.
///
/// Issues physical reads through the table handle, unshards the raw
/// per-shard streams into a single ordered sequence, and hands out rows
/// batch by batch. The active-range state makes the cursor resumable at
/// every batch boundary: exactly the rows between the last returned key
/// and the new frontier have been returned.
pub struct ResponseReader {
    table: Arc<dyn Table>,
    readgen: ReadGen,
    active_ranges: Option<ActiveRanges>,
    buffer: VecDeque<RgetItem>,
    started: bool,
    /// Reads issued before active ranges existed. At most one (the
    /// initial carve / sindex probe).
    pre_range_reads: usize,
    stamps: ShardStamps,
    epoch: Option<u64>,
}

impl ResponseReader {
    pub fn new(table: Arc<dyn Table>, readgen: ReadGen) -> Self {
        Self {
            table,
            readgen,
            active_ranges: None,
            buffer: VecDeque::new(),
            started: false,
            pre_range_reads: 0,
            stamps: ShardStamps::new(),
            epoch: None,
        }
    }

    pub fn readgen_mut(&mut self) -> &mut ReadGen {
        &mut self.readgen
    }

    pub fn readgen(&self) -> &ReadGen {
        &self.readgen
    }

    /// Whether any physical read has been issued yet. Transform
    /// push-down is only legal before that.
    pub fn is_started(&self) -> bool {
        self.started
    }

    fn shards_exhausted(&self) -> bool {
        self.active_ranges
            .as_ref()
            .map_or(false, ActiveRanges::totally_exhausted)
    }

    pub fn is_finished(&self) -> bool {
        self.started && self.buffer.is_empty() && self.shards_exhausted()
    }

    /// The accumulated per-shard changefeed stamps.
    ///
    /// Fails if stamps were requested but none ever arrived: the resume
    /// point is gone (typically a resharding raced the read) and the
    /// whole cursor must be retried.
    pub fn stamps(&self) -> error_stack::Result<ShardStamps, QueryError> {
        error_stack::ensure!(
            !(self.readgen.stamp() && self.stamps.is_empty()),
            QueryError::ResumableOpFailed("changefeed stamp info is missing".to_owned())
        );
        Ok(self.stamps.clone())
    }

    /// Fill the local buffer from the shards.
    ///
    /// Loops because a single physical read may legitimately return zero
    /// usable rows (every row filtered out shard-side, or saturated
    /// shards draining) without the traversal being finished.
    pub async fn load_items(
        &mut self,
        ctx: &QueryContext,
        batchspec: &BatchSpec,
    ) -> error_stack::Result<(), QueryError> {
        while self.buffer.is_empty() && !(self.started && self.shards_exhausted()) {
            if self.active_ranges.is_none() {
                // Only the initial carve may run before per-shard
                // frontiers exist.
                sanity_check!(
                    self.pre_range_reads == 0,
                    "multiple reads issued before active ranges exist"
                );
                self.pre_range_reads += 1;
            }
            let request =
                self.readgen
                    .next_read(self.active_ranges.as_ref(), batchspec, &ctx.options);
            let response = self
                .table
                .read_with_profile(request, &ctx.interruptor)
                .await?;
            let mut items = self.unshard(response);
            self.readgen.sindex_sort(&mut items);
            tracing::debug!(rows = items.len(), "unsharded one physical read");
            self.buffer.extend(items);
            self.started = true;
        }
        Ok(())
    }

    /// Merge one raw response into the buffer order, updating the
    /// per-shard frontiers.
    fn unshard(&mut self, response: ReadResponse) -> Vec<RgetItem> {
        if self.active_ranges.is_none() {
            let mut active_ranges = new_active_ranges(
                response
                    .shards
                    .iter()
                    .map(|shard| (shard.region.clone(), shard.hash_range)),
                self.readgen.original_range(),
            );
            self.readgen.restrict_active_ranges(&mut active_ranges);
            self.epoch = Some(response.epoch);
            self.active_ranges = Some(active_ranges);
        } else {
            // A logical read must see one sharding epoch end to end.
            sanity_check!(
                self.epoch == Some(response.epoch),
                "sharding epoch changed mid-read"
            );
        }
        if let Some(stamps) = response.stamps {
            self.stamps.extend(stamps);
        }
        let active_ranges = self.active_ranges.as_mut().expect("just initialized");
        unshard_response(active_ranges, self.readgen.sorting(), response.shards)
    }

    /// Pull the next batch of rows.
    ///
    /// An empty result means the traversal is finished. For
    /// `SindexConstant` batches the result is the full run of rows
    /// sharing the frontier row's index value, pulled across as many
    /// round-trips as needed and bounded by the configured array size
    /// limit.
    pub async fn next_batch(
        &mut self,
        ctx: &QueryContext,
        batchspec: &BatchSpec,
    ) -> error_stack::Result<Vec<RgetItem>, QueryError> {
        self.load_items(ctx, batchspec).await?;

        if batchspec.batch_type() == BatchType::SindexConstant {
            return self.next_sindex_run(ctx, batchspec).await;
        }

        let mut batcher = batchspec.to_batcher();
        let mut out = Vec::new();
        while let Some(item) = self.buffer.pop_front() {
            batcher.note_el(&item);
            out.push(item);
            if batcher.should_send_batch() {
                break;
            }
        }
        Ok(out)
    }

    /// Pull the maximal run of rows sharing the frontier row's index
    /// value (or, for rows without one, its primary key).
    async fn next_sindex_run(
        &mut self,
        ctx: &QueryContext,
        batchspec: &BatchSpec,
    ) -> error_stack::Result<Vec<RgetItem>, QueryError> {
        let Some(first) = self.buffer.front() else {
            return Ok(Vec::new());
        };
        let group_sindex: Option<DatumRef> = first.sindex_key.clone();
        let group_key = first.key.clone();

        let mut out = Vec::new();
        loop {
            while let Some(item) = self.buffer.front() {
                let same_group = match (&group_sindex, &item.sindex_key) {
                    (Some(group), Some(sindex)) => group == sindex,
                    (None, None) => group_key == item.key,
                    _ => false,
                };
                if !same_group {
                    return Ok(out);
                }
                error_stack::ensure!(
                    out.len() < ctx.options.array_size_limit,
                    QueryError::resource_limit(format!(
                        "more than {} rows share one index value",
                        ctx.options.array_size_limit
                    ))
                );
                out.push(self.buffer.pop_front().expect("front exists"));
            }
            if self.is_finished() {
                return Ok(out);
            }
            self.load_items(ctx, batchspec).await?;
            if self.buffer.is_empty() {
                return Ok(out);
            }
        }
    }

    /// Run a terminal accumulator over the whole stream in one shot,
    /// bypassing active-range tracking.
    pub async fn run_terminal(
        &mut self,
        ctx: &QueryContext,
        terminal: Terminal,
    ) -> error_stack::Result<DatumRef, QueryError> {
        let request = self.readgen.terminal_read(terminal.clone(), &ctx.options);
        let response = self
            .table
            .read_with_profile(request, &ctx.interruptor)
            .await?;
        if let Some(stamps) = response.stamps {
            self.stamps.extend(stamps);
        }
        let mut acc = TerminalResult::new(&terminal);
        for shard_acc in response.terminals {
            acc.merge(shard_acc)?;
        }
        Ok(acc.into_datum())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use shrike_batch::BatchOptions;
    use shrike_core::{Datum, KeyRange, Sorting, StoreKey};
    use shrike_store::{
        primary_key_of, Durability, FieldIndex, GeoPredicate, MemoryTable, Transform,
        WriteKind, WriteRequest,
    };

    use super::*;

    fn row(id: u32, group: f64) -> DatumRef {
        Datum::object([
            ("id".to_owned(), Datum::string(format!("{id:04}"))),
            ("group".to_owned(), Datum::number(group)),
        ])
    }

    async fn seeded_table(shards: usize, rows: u32) -> Arc<MemoryTable> {
        let mut table = MemoryTable::new(shards);
        table.create_index("group", Arc::new(FieldIndex("group".to_owned())));
        table
            .write_batched(
                WriteRequest {
                    kind: WriteKind::Insert,
                    rows: (0..rows).map(|i| row(i, f64::from(i % 7))).collect(),
                    durability: Durability::Soft,
                    return_changes: false,
                },
                &Default::default(),
            )
            .await
            .unwrap();
        Arc::new(table)
    }

    fn small_batches(max_els: i64) -> BatchSpec {
        BatchSpec::user(BatchOptions {
            max_els: Some(max_els),
            ..BatchOptions::default()
        })
        .unwrap()
        .with_new_batch_type(BatchType::Normal)
    }

    async fn drain(reader: &mut ResponseReader, spec: &BatchSpec) -> Vec<RgetItem> {
        let ctx = QueryContext::default();
        let mut all = Vec::new();
        loop {
            let batch = reader.next_batch(&ctx, spec).await.unwrap();
            if batch.is_empty() {
                assert!(reader.is_finished());
                return all;
            }
            all.extend(batch);
        }
    }

    #[tokio::test]
    async fn test_merge_totality_across_shard_counts() {
        for shards in [1, 2, 5] {
            let table = seeded_table(shards, 100).await;
            let readgen = ReadGen::primary(KeyRange::universe(), Sorting::Ascending, false);
            let mut reader = ResponseReader::new(table, readgen);

            // Tiny batches force many round-trips and saturation churn.
            let all = drain(&mut reader, &small_batches(7)).await;
            assert_eq!(all.len(), 100, "shards = {shards}");

            let mut keys: Vec<_> = all.iter().map(|item| item.key.clone()).collect();
            let unique: BTreeSet<_> = keys.iter().cloned().collect();
            assert_eq!(unique.len(), 100, "no duplicates, no omissions");
            let sorted = {
                keys.sort();
                keys
            };
            let returned: Vec<_> = all.iter().map(|item| item.key.clone()).collect();
            assert_eq!(returned, sorted, "ascending key order");
        }
    }

    #[tokio::test]
    async fn test_descending_order() {
        let table = seeded_table(3, 40).await;
        let readgen = ReadGen::primary(KeyRange::universe(), Sorting::Descending, false);
        let mut reader = ResponseReader::new(table, readgen);
        let all = drain(&mut reader, &small_batches(6)).await;
        assert_eq!(all.len(), 40);
        for pair in all.windows(2) {
            assert!(pair[0].key >= pair[1].key);
        }
    }

    #[tokio::test]
    async fn test_unordered_returns_everything() {
        let table = seeded_table(4, 64).await;
        let readgen = ReadGen::primary(KeyRange::universe(), Sorting::Unordered, false);
        let mut reader = ResponseReader::new(table, readgen);
        let all = drain(&mut reader, &small_batches(9)).await;
        let unique: BTreeSet<_> = all.iter().map(|item| item.key.clone()).collect();
        assert_eq!(unique.len(), 64);
    }

    #[tokio::test]
    async fn test_sindex_traversal_orders_by_index_value() {
        let table = seeded_table(3, 50).await;
        let readgen = ReadGen::sindex(
            "group",
            crate::sindex_datum_range(None, None),
            Sorting::Ascending,
            false,
        );
        let mut reader = ResponseReader::new(table, readgen);
        let all = drain(&mut reader, &small_batches(8)).await;
        assert_eq!(all.len(), 50);
        for pair in all.windows(2) {
            let a = pair[0].sindex_key.as_ref().unwrap();
            let b = pair[1].sindex_key.as_ref().unwrap();
            assert!(a <= b, "sindex order violated");
        }
    }

    #[tokio::test]
    async fn test_sindex_constant_groups_by_index_value() {
        let mut table = MemoryTable::new(2);
        table.create_index("group", Arc::new(FieldIndex("group".to_owned())));
        table
            .write_batched(
                WriteRequest {
                    kind: WriteKind::Insert,
                    rows: vec![row(1, 1.0), row(2, 1.0), row(3, 2.0)],
                    durability: Durability::Soft,
                    return_changes: false,
                },
                &Default::default(),
            )
            .await
            .unwrap();

        let readgen = ReadGen::sindex(
            "group",
            crate::sindex_datum_range(None, None),
            Sorting::Ascending,
            false,
        );
        let mut reader = ResponseReader::new(Arc::new(table), readgen);
        let ctx = QueryContext::default();
        let spec = BatchSpec::all().with_new_batch_type(BatchType::SindexConstant);

        let first = reader.next_batch(&ctx, &spec).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first
            .iter()
            .all(|item| item.sindex_key.as_ref().unwrap().as_number() == Some(1.0)));

        let second = reader.next_batch(&ctx, &spec).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(
            second[0].sindex_key.as_ref().unwrap().as_number(),
            Some(2.0)
        );

        assert!(reader.next_batch(&ctx, &spec).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sindex_run_length_is_bounded() {
        let mut table = MemoryTable::new(1);
        table.create_index("group", Arc::new(FieldIndex("group".to_owned())));
        table
            .write_batched(
                WriteRequest {
                    kind: WriteKind::Insert,
                    rows: (0..10).map(|i| row(i, 1.0)).collect(),
                    durability: Durability::Soft,
                    return_changes: false,
                },
                &Default::default(),
            )
            .await
            .unwrap();

        let readgen = ReadGen::sindex(
            "group",
            crate::sindex_datum_range(None, None),
            Sorting::Ascending,
            false,
        );
        let mut reader = ResponseReader::new(Arc::new(table), readgen);
        let ctx = QueryContext {
            options: shrike_core::QueryOptions {
                array_size_limit: 5,
                ..Default::default()
            },
            ..Default::default()
        };
        let spec = BatchSpec::all().with_new_batch_type(BatchType::SindexConstant);
        let result = reader.next_batch(&ctx, &spec).await;
        assert!(matches!(
            result.unwrap_err().current_context(),
            QueryError::ResourceLimit(_)
        ));
    }

    #[tokio::test]
    async fn test_get_all_restricts_to_key_span() {
        let table = seeded_table(4, 100).await;
        let keys: BTreeSet<StoreKey> = [row(3, 0.0), row(47, 0.0), row(99, 0.0)]
            .iter()
            .map(|r| primary_key_of(r).unwrap())
            .collect();
        let readgen = ReadGen::primary_keys(keys.clone(), false);
        let mut reader = ResponseReader::new(table, readgen);
        let all = drain(&mut reader, &small_batches(100)).await;
        // Point-style reads still range-scan, so rows between the keys
        // appear; the span outside the key set must not.
        let returned: BTreeSet<_> = all.iter().map(|item| item.key.clone()).collect();
        for key in &keys {
            assert!(returned.contains(key));
        }
        let span_left = keys.first().unwrap();
        let span_right = keys.last().unwrap();
        for key in &returned {
            assert!(key >= span_left && key <= span_right);
        }
    }

    #[tokio::test]
    async fn test_filter_pushdown_returns_only_matches() {
        let table = seeded_table(2, 60).await;
        let mut readgen = ReadGen::primary(KeyRange::universe(), Sorting::Ascending, false);
        readgen.add_transform(Transform::filter(|datum: &DatumRef| {
            datum.get_field("group").and_then(|g| g.as_number()) == Some(0.0)
        }));
        let mut reader = ResponseReader::new(table, readgen);
        let all = drain(&mut reader, &small_batches(4)).await;
        // Groups cycle mod 7: ids 0, 7, 14, ... 56.
        assert_eq!(all.len(), 9);
    }

    #[tokio::test]
    async fn test_terminal_count_and_sum() {
        let table = seeded_table(3, 30).await;
        let ctx = QueryContext::default();

        let readgen = ReadGen::primary(KeyRange::universe(), Sorting::Unordered, false);
        let mut reader = ResponseReader::new(table.clone(), readgen);
        let count = reader.run_terminal(&ctx, Terminal::Count).await.unwrap();
        assert_eq!(count.as_number(), Some(30.0));

        let readgen = ReadGen::primary(KeyRange::universe(), Sorting::Unordered, false);
        let mut reader = ResponseReader::new(table, readgen);
        let sum = reader
            .run_terminal(&ctx, Terminal::Sum("group".to_owned()))
            .await
            .unwrap();
        let expected: f64 = (0..30).map(|i| f64::from(i % 7)).sum();
        assert_eq!(sum.as_number(), Some(expected));
    }

    #[tokio::test]
    async fn test_stamps_surface_and_fail_when_missing() {
        let table = seeded_table(2, 10).await;
        let readgen = ReadGen::primary(KeyRange::universe(), Sorting::Ascending, true);
        let mut reader = ResponseReader::new(table, readgen);

        // Before any read arrives, the stamp info is missing.
        let result = reader.stamps();
        assert!(matches!(
            result.unwrap_err().current_context(),
            QueryError::ResumableOpFailed(_)
        ));

        drain(&mut reader, &small_batches(4)).await;
        let stamps = reader.stamps().unwrap();
        assert_eq!(stamps.len(), 2);
        // One stamp bump per written row, across the two shards.
        assert_eq!(stamps.values().sum::<u64>(), 10);
    }

    struct Interval {
        lo: f64,
        hi: f64,
    }

    impl GeoPredicate for Interval {
        fn intersects(&self, datum: &Datum) -> bool {
            datum
                .as_number()
                .map_or(false, |n| n >= self.lo && n <= self.hi)
        }
    }

    #[tokio::test]
    async fn test_intersecting_read_applies_the_oracle() {
        let table = seeded_table(2, 70).await;
        let readgen = ReadGen::intersecting(
            "group",
            Arc::new(Interval { lo: 2.0, hi: 3.0 }),
            false,
        );
        let mut reader = ResponseReader::new(table, readgen);
        let all = drain(&mut reader, &small_batches(16)).await;
        assert_eq!(all.len(), 20);
        assert!(all.iter().all(|item| {
            let group = item.sindex_key.as_ref().unwrap().as_number().unwrap();
            (2.0..=3.0).contains(&group)
        }));
    }

    #[tokio::test]
    async fn test_interruption_propagates() {
        let table = seeded_table(1, 10).await;
        let readgen = ReadGen::primary(KeyRange::universe(), Sorting::Ascending, false);
        let mut reader = ResponseReader::new(table, readgen);
        let ctx = QueryContext::default();
        ctx.interruptor.cancel();
        let result = reader.next_batch(&ctx, &small_batches(4)).await;
        assert!(matches!(
            result.unwrap_err().current_context(),
            QueryError::Interrupted
        ));
    }
}
