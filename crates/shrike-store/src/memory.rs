use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use shrike_core::{
    key_hash, sindex_item_key, DatumRef, HashRange, KeyRange, QueryError, RgetItem, Sorting,
    StoreKey,
};
use tokio_util::sync::CancellationToken;

use crate::{
    apply_transforms, IntersectingRead, PointRead, RangeRead, ReadRequest, ReadResponse,
    ShardStamps, ShardStream, SindexFn, Table, Terminal, TerminalResult, Transform,
    WriteChange, WriteKind, WriteRequest, WriteResponse,
};

/// An in-memory hash-sharded ordered store.
///
/// The reference [`Table`] backend: every shard is an ordered map over
/// the primary key space plus one ordered map per secondary index, and
/// carries a monotonic changefeed stamp bumped by each write.
pub struct MemoryTable {
    shards: Vec<ShardSlot>,
    index_defs: BTreeMap<String, Arc<dyn SindexFn>>,
    epoch: u64,
}

struct ShardSlot {
    hash_range: HashRange,
    data: RwLock<Shard>,
}

#[derive(Default)]
struct Shard {
    rows: BTreeMap<StoreKey, DatumRef>,
    /// Per sindex, entries keyed by the encoded index key (index value
    /// with the primary key appended).
    indexes: BTreeMap<String, BTreeMap<StoreKey, IndexEntry>>,
    stamp: u64,
}

#[derive(Clone)]
struct IndexEntry {
    primary: StoreKey,
    sindex: DatumRef,
    datum: DatumRef,
}

impl MemoryTable {
    pub fn new(shard_count: usize) -> Self {
        assert!(shard_count >= 1, "a table needs at least one shard");
        let step = u64::MAX / shard_count as u64;
        let shards = (0..shard_count as u64)
            .map(|i| {
                let end = if i == shard_count as u64 - 1 {
                    u64::MAX
                } else {
                    (i + 1) * step
                };
                ShardSlot {
                    hash_range: HashRange::new(i * step, end),
                    data: RwLock::new(Shard::default()),
                }
            })
            .collect();
        Self {
            shards,
            index_defs: BTreeMap::new(),
            epoch: 0,
        }
    }

    /// Register a secondary index, reindexing existing rows.
    pub fn create_index(&mut self, name: impl Into<String>, def: Arc<dyn SindexFn>) {
        let name = name.into();
        for slot in &self.shards {
            let mut shard = slot.data.write();
            let mut entries = BTreeMap::new();
            for (primary, datum) in &shard.rows {
                if let Some(sindex) = def.index(datum) {
                    entries.insert(
                        sindex_item_key(&sindex, primary),
                        IndexEntry {
                            primary: primary.clone(),
                            sindex,
                            datum: datum.clone(),
                        },
                    );
                }
            }
            shard.indexes.insert(name.clone(), entries);
        }
        self.index_defs.insert(name, def);
    }

    fn slot_for(&self, key: &StoreKey) -> &ShardSlot {
        let hash = key_hash(key);
        self.shards
            .iter()
            .find(|slot| slot.hash_range.contains(hash))
            .unwrap_or_else(|| self.shards.last().expect("at least one shard"))
    }

    fn read_range(
        &self,
        read: &RangeRead,
        interruptor: &CancellationToken,
    ) -> error_stack::Result<ReadResponse, QueryError> {
        let mut shards = Vec::new();
        let mut terminals = Vec::new();
        let mut stamps = read.stamp.then(ShardStamps::new);

        for slot in &self.shards {
            check_interruptor(interruptor)?;
            // Shards missing from a present hint map are not read.
            let hint = match &read.hints {
                None => None,
                Some(hints) => match hints.get(&slot.hash_range) {
                    Some(hint) => hint.as_ref(),
                    None => continue,
                },
            };

            let shard = slot.data.read();
            if let Some(stamps) = stamps.as_mut() {
                stamps.insert(slot.hash_range, shard.stamp);
            }

            let batch_rows = if read.terminal.is_some() {
                // Terminal reads must eventually return all data.
                usize::MAX
            } else {
                read.batch_rows
            };

            let mut acc = read.terminal.as_ref().map(TerminalResult::new);
            let mut items = Vec::new();
            let scan = match &read.sindex {
                None => scan_tree(
                    &shard.rows,
                    &read.region,
                    hint,
                    read.sorting,
                    batch_rows,
                    |key, datum| {
                        emit(
                            &read.transforms,
                            read.terminal.as_ref(),
                            acc.as_mut(),
                            &mut items,
                            RgetItem::new(key.clone(), datum.clone()),
                        )
                    },
                )?,
                Some(name) => {
                    let entries = shard.indexes.get(name).ok_or_else(|| {
                        error_stack::report!(QueryError::logic(format!(
                            "unknown secondary index `{name}`"
                        )))
                    })?;
                    scan_tree(
                        entries,
                        &read.region,
                        hint,
                        read.sorting,
                        batch_rows,
                        |_, entry| {
                            emit(
                                &read.transforms,
                                read.terminal.as_ref(),
                                acc.as_mut(),
                                &mut items,
                                RgetItem::with_sindex_key(
                                    entry.primary.clone(),
                                    entry.sindex.clone(),
                                    entry.datum.clone(),
                                ),
                            )
                        },
                    )?
                }
            };

            if let Some(acc) = acc {
                terminals.push(acc);
            }
            shards.push(ShardStream {
                region: KeyRange::universe(),
                hash_range: slot.hash_range,
                items,
                last_key: scan,
            });
        }

        Ok(ReadResponse {
            shards,
            stamps,
            terminals,
            epoch: self.epoch,
        })
    }

    fn read_point(
        &self,
        read: &PointRead,
        interruptor: &CancellationToken,
    ) -> error_stack::Result<ReadResponse, QueryError> {
        check_interruptor(interruptor)?;
        let mut shards = Vec::new();
        let mut stamps = read.stamp.then(ShardStamps::new);
        for slot in &self.shards {
            let shard = slot.data.read();
            if let Some(stamps) = stamps.as_mut() {
                stamps.insert(slot.hash_range, shard.stamp);
            }
            let items = read
                .keys
                .iter()
                .filter(|key| slot.hash_range.contains(key_hash(key)))
                .filter_map(|key| {
                    shard
                        .rows
                        .get(key)
                        .map(|datum| RgetItem::new(key.clone(), datum.clone()))
                })
                .collect();
            shards.push(ShardStream {
                region: KeyRange::universe(),
                hash_range: slot.hash_range,
                items,
                last_key: None,
            });
        }
        Ok(ReadResponse {
            shards,
            stamps,
            terminals: Vec::new(),
            epoch: self.epoch,
        })
    }

    fn read_intersecting(
        &self,
        read: &IntersectingRead,
        interruptor: &CancellationToken,
    ) -> error_stack::Result<ReadResponse, QueryError> {
        let mut shards = Vec::new();
        let mut terminals = Vec::new();
        let mut stamps = read.stamp.then(ShardStamps::new);
        let mut processed = 0usize;

        for slot in &self.shards {
            check_interruptor(interruptor)?;
            let shard = slot.data.read();
            if let Some(stamps) = stamps.as_mut() {
                stamps.insert(slot.hash_range, shard.stamp);
            }
            let entries = shard.indexes.get(&read.sindex).ok_or_else(|| {
                error_stack::report!(QueryError::logic(format!(
                    "unknown secondary index `{}`",
                    read.sindex
                )))
            })?;

            let mut acc = read.terminal.as_ref().map(TerminalResult::new);
            let mut items = Vec::new();
            for entry in entries.values() {
                processed += 1;
                error_stack::ensure!(
                    processed <= read.processed_limit,
                    QueryError::resource_limit(format!(
                        "geo intersection processed more than {} index entries",
                        read.processed_limit
                    ))
                );
                if !read.geometry.intersects(&entry.sindex) {
                    continue;
                }
                emit(
                    &read.transforms,
                    read.terminal.as_ref(),
                    acc.as_mut(),
                    &mut items,
                    RgetItem::with_sindex_key(
                        entry.primary.clone(),
                        entry.sindex.clone(),
                        entry.datum.clone(),
                    ),
                )?;
            }

            if let Some(acc) = acc {
                terminals.push(acc);
            }
            shards.push(ShardStream {
                region: KeyRange::universe(),
                hash_range: slot.hash_range,
                items,
                last_key: None,
            });
        }

        Ok(ReadResponse {
            shards,
            stamps,
            terminals,
            epoch: self.epoch,
        })
    }
}

fn check_interruptor(interruptor: &CancellationToken) -> error_stack::Result<(), QueryError> {
    error_stack::ensure!(!interruptor.is_cancelled(), QueryError::Interrupted);
    Ok(())
}

/// Run one raw row through the transforms and into either the terminal
/// accumulator or the output items.
fn emit(
    transforms: &[Transform],
    terminal: Option<&Terminal>,
    acc: Option<&mut TerminalResult>,
    items: &mut Vec<RgetItem>,
    item: RgetItem,
) -> error_stack::Result<(), QueryError> {
    let Some(datum) = apply_transforms(transforms, &item.datum)? else {
        return Ok(());
    };
    match (terminal, acc) {
        (Some(terminal), Some(acc)) => acc.note(terminal, &datum)?,
        _ => items.push(RgetItem { datum, ..item }),
    }
    Ok(())
}

/// Scan one ordered map within `region`, resuming from `hint`, visiting
/// at most `batch_rows` raw entries.
///
/// Returns the furthest key scanned when the allowance ran out, or
/// `None` when the scan reached the end of the requested range.
fn scan_tree<V>(
    tree: &BTreeMap<StoreKey, V>,
    region: &KeyRange,
    hint: Option<&StoreKey>,
    sorting: Sorting,
    batch_rows: usize,
    mut visit: impl FnMut(&StoreKey, &V) -> error_stack::Result<(), QueryError>,
) -> error_stack::Result<Option<StoreKey>, QueryError> {
    let iter: Box<dyn Iterator<Item = (&StoreKey, &V)>> = if sorting.is_descending() {
        let lower = region.left.clone();
        let upper = match (hint, region.right_key()) {
            (Some(hint), Some(right)) => Some(hint.min(right).clone()),
            (Some(hint), None) => Some(hint.clone()),
            (None, Some(right)) => Some(right.clone()),
            (None, None) => None,
        };
        match upper {
            Some(upper) if upper < lower => return Ok(None),
            Some(upper) => {
                Box::new(tree.range((Bound::Included(lower), Bound::Excluded(upper))).rev())
            }
            None => Box::new(tree.range((Bound::Included(lower), Bound::Unbounded)).rev()),
        }
    } else {
        let start = match hint {
            Some(hint) => hint.clone().max(region.left.clone()),
            None => region.left.clone(),
        };
        match region.right_key() {
            Some(right) if *right < start => return Ok(None),
            Some(right) => Box::new(
                tree.range((Bound::Included(start), Bound::Excluded(right.clone()))),
            ),
            None => Box::new(tree.range((Bound::Included(start), Bound::Unbounded))),
        }
    };

    let mut scanned = 0;
    let mut last = None;
    for (key, value) in iter {
        if scanned >= batch_rows {
            return Ok(last);
        }
        scanned += 1;
        last = Some(key.clone());
        visit(key, value)?;
    }
    Ok(None)
}

#[async_trait]
impl Table for MemoryTable {
    fn shard_layout(&self) -> Vec<(KeyRange, HashRange)> {
        self.shards
            .iter()
            .map(|slot| (KeyRange::universe(), slot.hash_range))
            .collect()
    }

    async fn read(
        &self,
        request: ReadRequest,
        interruptor: &CancellationToken,
    ) -> error_stack::Result<ReadResponse, QueryError> {
        match &request {
            ReadRequest::Range(read) => self.read_range(read, interruptor),
            ReadRequest::Point(read) => self.read_point(read, interruptor),
            ReadRequest::Intersecting(read) => self.read_intersecting(read, interruptor),
        }
    }

    async fn write_batched(
        &self,
        request: WriteRequest,
        interruptor: &CancellationToken,
    ) -> error_stack::Result<WriteResponse, QueryError> {
        let mut response = WriteResponse::default();
        for row in &request.rows {
            check_interruptor(interruptor)?;
            let primary = primary_key_of(row)?;
            let slot = self.slot_for(&primary);
            let mut shard = slot.data.write();

            if request.kind == WriteKind::Insert && shard.rows.contains_key(&primary) {
                response.errors += 1;
                response
                    .first_error
                    .get_or_insert_with(|| "duplicate primary key".to_owned());
                continue;
            }

            let old = shard.rows.insert(primary.clone(), row.clone());
            for (name, def) in &self.index_defs {
                let entries = shard.indexes.entry(name.clone()).or_default();
                if let Some(old_row) = &old {
                    if let Some(old_sindex) = def.index(old_row) {
                        entries.remove(&sindex_item_key(&old_sindex, &primary));
                    }
                }
                if let Some(sindex) = def.index(row) {
                    entries.insert(
                        sindex_item_key(&sindex, &primary),
                        IndexEntry {
                            primary: primary.clone(),
                            sindex,
                            datum: row.clone(),
                        },
                    );
                }
            }
            shard.stamp += 1;

            match old {
                Some(old) => {
                    response.replaced += 1;
                    if request.return_changes {
                        response.changes.push(WriteChange {
                            old: Some(old),
                            new: Some(row.clone()),
                        });
                    }
                }
                None => {
                    response.inserted += 1;
                    if request.return_changes {
                        response.changes.push(WriteChange {
                            old: None,
                            new: Some(row.clone()),
                        });
                    }
                }
            }
        }
        Ok(response)
    }
}

/// The primary key of a row: the encoded `id` field.
pub fn primary_key_of(row: &DatumRef) -> error_stack::Result<StoreKey, QueryError> {
    row.get_field("id")
        .map(|id| id.to_sindex_key())
        .ok_or_else(|| error_stack::report!(QueryError::logic("row has no `id` field")))
}

#[cfg(test)]
mod tests {
    use shrike_core::Datum;

    use super::*;

    fn row(id: &str, score: f64) -> DatumRef {
        Datum::object([
            ("id".to_owned(), Datum::string(id)),
            ("score".to_owned(), Datum::number(score)),
        ])
    }

    async fn seeded(shards: usize) -> MemoryTable {
        let mut table = MemoryTable::new(shards);
        table.create_index("score", Arc::new(crate::FieldIndex("score".to_owned())));
        let rows = (0..26u8)
            .map(|i| row(&format!("{}", (b'a' + i) as char), f64::from(i % 5)))
            .collect();
        table
            .write_batched(
                WriteRequest {
                    kind: WriteKind::Insert,
                    rows,
                    durability: crate::Durability::Soft,
                    return_changes: false,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        table
    }

    fn full_range_read(batch_rows: usize) -> ReadRequest {
        ReadRequest::Range(RangeRead {
            region: KeyRange::universe(),
            hints: None,
            sorting: Sorting::Ascending,
            sindex: None,
            transforms: Vec::new(),
            terminal: None,
            batch_rows,
            stamp: false,
        })
    }

    #[tokio::test]
    async fn test_range_read_returns_all_rows_in_key_order() {
        let table = seeded(4).await;
        let response = table
            .read(full_range_read(usize::MAX), &CancellationToken::new())
            .await
            .unwrap();

        let total: usize = response.shards.iter().map(|s| s.items.len()).sum();
        assert_eq!(total, 26);
        for shard in &response.shards {
            // Each shard scanned to the end of its range.
            assert_eq!(shard.last_key, None);
            let keys: Vec<_> = shard.items.iter().map(|i| i.key.clone()).collect();
            let mut sorted = keys.clone();
            sorted.sort();
            assert_eq!(keys, sorted);
        }
    }

    #[tokio::test]
    async fn test_batch_rows_truncates_and_reports_frontier() {
        let table = seeded(1).await;
        let response = table
            .read(full_range_read(10), &CancellationToken::new())
            .await
            .unwrap();
        let shard = &response.shards[0];
        assert_eq!(shard.items.len(), 10);
        assert_eq!(shard.last_key.as_ref(), Some(&shard.items[9].key));
    }

    #[tokio::test]
    async fn test_filter_advances_frontier_past_dropped_rows() {
        let table = seeded(1).await;
        let response = table
            .read(
                ReadRequest::Range(RangeRead {
                    region: KeyRange::universe(),
                    hints: None,
                    sorting: Sorting::Ascending,
                    sindex: None,
                    transforms: vec![Transform::filter(|_| false)],
                    terminal: None,
                    batch_rows: 10,
                    stamp: false,
                }),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let shard = &response.shards[0];
        // Nothing survived, but the scan still made progress.
        assert!(shard.items.is_empty());
        assert!(shard.last_key.is_some());
    }

    #[tokio::test]
    async fn test_sindex_read_orders_by_index_value() {
        let table = seeded(2).await;
        let response = table
            .read(
                ReadRequest::Range(RangeRead {
                    region: KeyRange::universe(),
                    hints: None,
                    sorting: Sorting::Ascending,
                    sindex: Some("score".to_owned()),
                    transforms: Vec::new(),
                    terminal: None,
                    batch_rows: usize::MAX,
                    stamp: false,
                }),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        for shard in &response.shards {
            let sindexes: Vec<_> = shard
                .items
                .iter()
                .map(|item| item.sindex_key.clone().unwrap())
                .collect();
            let mut sorted = sindexes.clone();
            sorted.sort();
            assert_eq!(sindexes, sorted);
        }
    }

    #[tokio::test]
    async fn test_terminal_count_consumes_rows() {
        let table = seeded(4).await;
        let response = table
            .read(
                ReadRequest::Range(RangeRead {
                    region: KeyRange::universe(),
                    hints: None,
                    sorting: Sorting::Unordered,
                    sindex: None,
                    transforms: Vec::new(),
                    terminal: Some(Terminal::Count),
                    batch_rows: 1,
                    stamp: false,
                }),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let mut total = TerminalResult::Count(0);
        for acc in response.terminals {
            total.merge(acc).unwrap();
        }
        assert_eq!(total, TerminalResult::Count(26));
        assert!(response.shards.iter().all(|s| s.items.is_empty()));
    }

    #[tokio::test]
    async fn test_point_read_finds_rows() {
        let table = seeded(4).await;
        let keys = vec![
            primary_key_of(&row("c", 0.0)).unwrap(),
            primary_key_of(&row("z", 0.0)).unwrap(),
            StoreKey::from("missing"),
        ];
        let response = table
            .read(
                ReadRequest::Point(PointRead { keys, stamp: false }),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let total: usize = response.shards.iter().map(|s| s.items.len()).sum();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_writes_bump_stamps() {
        let table = seeded(2).await;
        let before = table
            .read(
                ReadRequest::Point(PointRead {
                    keys: Vec::new(),
                    stamp: true,
                }),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        table
            .write_batched(
                WriteRequest {
                    kind: WriteKind::Replace,
                    rows: vec![row("a", 9.0)],
                    durability: crate::Durability::Hard,
                    return_changes: false,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let after = table
            .read(
                ReadRequest::Point(PointRead {
                    keys: Vec::new(),
                    stamp: true,
                }),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let sum = |stamps: &ShardStamps| stamps.values().sum::<u64>();
        assert_eq!(
            sum(after.stamps.as_ref().unwrap()),
            sum(before.stamps.as_ref().unwrap()) + 1
        );
    }

    #[tokio::test]
    async fn test_interruption_fails_reads() {
        let table = seeded(1).await;
        let interruptor = CancellationToken::new();
        interruptor.cancel();
        let result = table.read(full_range_read(1), &interruptor).await;
        assert!(matches!(
            result.unwrap_err().current_context(),
            QueryError::Interrupted
        ));
    }
}
