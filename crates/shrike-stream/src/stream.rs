use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use shrike_batch::BatchSpec;
use shrike_core::{DatumRef, QueryError};
use shrike_read::{QueryContext, ReadGen, ResponseReader};
use shrike_store::{DatumFn, DatumPredicate, Table, Terminal, TerminalResult, Transform};

use crate::UnionStream;

/// Cooperatively yield every this many rows processed in a tight loop,
/// so a long non-blocking pipeline cannot starve its neighbours.
pub(crate) const YIELD_INTERVAL: usize = 256;

pub(crate) async fn maybe_yield(counter: &mut usize) {
    *counter += 1;
    if *counter % YIELD_INTERVAL == 0 {
        tokio::task::yield_now().await;
    }
}

/// How a stream has been consumed so far. Mixing single-row and batched
/// consumption on one stream is a logic error.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConsumeMode {
    Unset,
    Single,
    Batched,
}

/// A composable, pull-based stream of datums.
pub struct DatumStream {
    mode: ConsumeMode,
    /// Buffer for single-row consumption.
    pending: VecDeque<DatumRef>,
    kind: StreamKind,
}

/// The closed set of stream stages.
pub enum StreamKind {
    /// A fully materialized array.
    Eager(EagerStream),
    /// A live table traversal through the shard-merging reader.
    Lazy(Box<LazyStream>),
    Slice(SliceStream),
    Map(MapStream),
    Filter(FilterStream),
    OrderedDistinct(OrderedDistinctStream),
    Union(UnionStream),
}

pub struct EagerStream {
    rows: VecDeque<DatumRef>,
}

pub struct LazyStream {
    pub(crate) reader: ResponseReader,
}

pub struct SliceStream {
    inner: Box<DatumStream>,
    skip_left: usize,
    take_left: Option<usize>,
}

pub struct MapStream {
    inner: Box<DatumStream>,
    func: Arc<dyn DatumFn>,
}

pub struct FilterStream {
    inner: Box<DatumStream>,
    predicate: Arc<dyn DatumPredicate>,
}

pub struct OrderedDistinctStream {
    inner: Box<DatumStream>,
    last: Option<DatumRef>,
}

/// Box the recursive `next_batch` call so stream stages can nest.
pub(crate) fn boxed_next_batch<'a>(
    stream: &'a mut DatumStream,
    ctx: &'a QueryContext,
    batchspec: &'a BatchSpec,
) -> BoxFuture<'a, error_stack::Result<Vec<DatumRef>, QueryError>> {
    Box::pin(stream.next_batch(ctx, batchspec))
}

impl DatumStream {
    pub fn eager(rows: impl IntoIterator<Item = DatumRef>) -> Self {
        Self::from_kind(StreamKind::Eager(EagerStream {
            rows: rows.into_iter().collect(),
        }))
    }

    pub fn lazy(table: Arc<dyn Table>, readgen: ReadGen) -> Self {
        Self::from_kind(StreamKind::Lazy(Box::new(LazyStream {
            reader: ResponseReader::new(table, readgen),
        })))
    }

    pub fn union(streams: Vec<DatumStream>) -> Self {
        Self::from_kind(StreamKind::Union(UnionStream::new(streams)))
    }

    fn from_kind(kind: StreamKind) -> Self {
        Self {
            mode: ConsumeMode::Unset,
            pending: VecDeque::new(),
            kind,
        }
    }

    /// Skip `skip` rows, then pass through at most `take` rows.
    pub fn slice(self, skip: usize, take: Option<usize>) -> Self {
        Self::from_kind(StreamKind::Slice(SliceStream {
            inner: Box::new(self),
            skip_left: skip,
            take_left: take,
        }))
    }

    /// Apply a mapping function to every row.
    ///
    /// Pushes down into the shard-local read when the underlying
    /// traversal has not started; otherwise composes a stream stage.
    pub fn map(self, func: Arc<dyn DatumFn>) -> Self {
        match self.try_push_down(|| Transform::Map(func.clone())) {
            Ok(stream) => stream,
            Err(stream) => Self::from_kind(StreamKind::Map(MapStream {
                inner: Box::new(stream),
                func,
            })),
        }
    }

    /// Keep only rows matching the predicate, with the same push-down
    /// rule as [`map`](Self::map).
    pub fn filter(self, predicate: Arc<dyn DatumPredicate>) -> Self {
        match self.try_push_down(|| Transform::Filter(predicate.clone())) {
            Ok(stream) => stream,
            Err(stream) => Self::from_kind(StreamKind::Filter(FilterStream {
                inner: Box::new(stream),
                predicate,
            })),
        }
    }

    /// Drop consecutive duplicate rows of an ordered stream.
    pub fn ordered_distinct(self) -> Self {
        Self::from_kind(StreamKind::OrderedDistinct(OrderedDistinctStream {
            inner: Box::new(self),
            last: None,
        }))
    }

    /// Push a transform into the underlying read if it is still
    /// untouched; hand the stream back otherwise.
    fn try_push_down(
        mut self,
        transform: impl FnOnce() -> Transform,
    ) -> Result<Self, Self> {
        match &mut self.kind {
            StreamKind::Lazy(lazy)
                if !lazy.reader.is_started() && self.mode == ConsumeMode::Unset =>
            {
                lazy.reader.readgen_mut().add_transform(transform());
                Ok(self)
            }
            _ => Err(self),
        }
    }

    /// Whether this stream feeds from a changefeed. Feed sub-streams are
    /// exempt from the union's read-concurrency cap, since they must not
    /// block each other.
    pub fn is_feed(&self) -> bool {
        false
    }

    pub fn is_exhausted(&self) -> bool {
        if !self.pending.is_empty() {
            return false;
        }
        match &self.kind {
            StreamKind::Eager(eager) => eager.rows.is_empty(),
            StreamKind::Lazy(lazy) => lazy.reader.is_finished(),
            StreamKind::Slice(slice) => {
                slice.take_left == Some(0) || slice.inner.is_exhausted()
            }
            StreamKind::Map(map) => map.inner.is_exhausted(),
            StreamKind::Filter(filter) => filter.inner.is_exhausted(),
            StreamKind::OrderedDistinct(distinct) => distinct.inner.is_exhausted(),
            StreamKind::Union(union) => union.is_exhausted(),
        }
    }

    /// Pull the next batch. An empty result means the stream is done.
    pub async fn next_batch(
        &mut self,
        ctx: &QueryContext,
        batchspec: &BatchSpec,
    ) -> error_stack::Result<Vec<DatumRef>, QueryError> {
        error_stack::ensure!(
            self.mode != ConsumeMode::Single,
            QueryError::logic("cannot mix `next` and `next_batch` on one stream")
        );
        self.mode = ConsumeMode::Batched;
        self.next_batch_impl(ctx, batchspec).await
    }

    /// Pull a single row. `None` means the stream is done.
    pub async fn next(
        &mut self,
        ctx: &QueryContext,
        batchspec: &BatchSpec,
    ) -> error_stack::Result<Option<DatumRef>, QueryError> {
        error_stack::ensure!(
            self.mode != ConsumeMode::Batched,
            QueryError::logic("cannot mix `next` and `next_batch` on one stream")
        );
        self.mode = ConsumeMode::Single;
        while self.pending.is_empty() {
            let batch = self.next_batch_impl(ctx, batchspec).await?;
            if batch.is_empty() {
                return Ok(None);
            }
            self.pending.extend(batch);
        }
        Ok(self.pending.pop_front())
    }

    async fn next_batch_impl(
        &mut self,
        ctx: &QueryContext,
        batchspec: &BatchSpec,
    ) -> error_stack::Result<Vec<DatumRef>, QueryError> {
        match &mut self.kind {
            StreamKind::Eager(eager) => eager.next_batch(batchspec).await,
            StreamKind::Lazy(lazy) => {
                let items = lazy.reader.next_batch(ctx, batchspec).await?;
                Ok(items.into_iter().map(|item| item.datum).collect())
            }
            StreamKind::Slice(slice) => slice.next_batch(ctx, batchspec).await,
            StreamKind::Map(map) => map.next_batch(ctx, batchspec).await,
            StreamKind::Filter(filter) => filter.next_batch(ctx, batchspec).await,
            StreamKind::OrderedDistinct(distinct) => distinct.next_batch(ctx, batchspec).await,
            StreamKind::Union(union) => union.next_batch(ctx, batchspec).await,
        }
    }

    /// Fold the whole stream into a terminal accumulator.
    ///
    /// An untouched lazy stream pushes the terminal down to the shards;
    /// anything else folds batches locally.
    pub async fn run_terminal(
        &mut self,
        ctx: &QueryContext,
        terminal: Terminal,
    ) -> error_stack::Result<DatumRef, QueryError> {
        if let StreamKind::Lazy(lazy) = &mut self.kind {
            if !lazy.reader.is_started() && self.mode == ConsumeMode::Unset {
                return lazy.reader.run_terminal(ctx, terminal).await;
            }
        }
        let batchspec = BatchSpec::all();
        let mut acc = TerminalResult::new(&terminal);
        loop {
            let batch = boxed_next_batch(self, ctx, &batchspec).await?;
            if batch.is_empty() {
                return Ok(acc.into_datum());
            }
            for datum in &batch {
                acc.note(&terminal, datum)?;
            }
        }
    }
}

impl EagerStream {
    async fn next_batch(
        &mut self,
        batchspec: &BatchSpec,
    ) -> error_stack::Result<Vec<DatumRef>, QueryError> {
        let mut batcher = batchspec.to_batcher();
        let mut out = Vec::new();
        let mut work = 0;
        while let Some(datum) = self.rows.pop_front() {
            batcher.note_size(datum.serialized_size());
            out.push(datum);
            if batcher.should_send_batch() {
                break;
            }
            maybe_yield(&mut work).await;
        }
        Ok(out)
    }
}

impl SliceStream {
    async fn next_batch(
        &mut self,
        ctx: &QueryContext,
        batchspec: &BatchSpec,
    ) -> error_stack::Result<Vec<DatumRef>, QueryError> {
        loop {
            if self.take_left == Some(0) {
                return Ok(Vec::new());
            }
            let mut batch = boxed_next_batch(&mut self.inner, ctx, batchspec).await?;
            if batch.is_empty() {
                return Ok(batch);
            }
            if self.skip_left > 0 {
                let dropped = self.skip_left.min(batch.len());
                batch.drain(..dropped);
                self.skip_left -= dropped;
            }
            if let Some(take_left) = &mut self.take_left {
                if batch.len() > *take_left {
                    batch.truncate(*take_left);
                }
                *take_left -= batch.len();
            }
            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }
}

impl MapStream {
    async fn next_batch(
        &mut self,
        ctx: &QueryContext,
        batchspec: &BatchSpec,
    ) -> error_stack::Result<Vec<DatumRef>, QueryError> {
        let batch = boxed_next_batch(&mut self.inner, ctx, batchspec).await?;
        let mut out = Vec::with_capacity(batch.len());
        let mut work = 0;
        for datum in &batch {
            out.push(self.func.call(datum)?);
            maybe_yield(&mut work).await;
        }
        Ok(out)
    }
}

impl FilterStream {
    async fn next_batch(
        &mut self,
        ctx: &QueryContext,
        batchspec: &BatchSpec,
    ) -> error_stack::Result<Vec<DatumRef>, QueryError> {
        // Keep pulling until something passes: returning an empty batch
        // would end the stream early.
        let mut work = 0;
        loop {
            let batch = boxed_next_batch(&mut self.inner, ctx, batchspec).await?;
            if batch.is_empty() {
                return Ok(batch);
            }
            let mut out = Vec::new();
            for datum in &batch {
                if self.predicate.test(datum)? {
                    out.push(datum.clone());
                }
                maybe_yield(&mut work).await;
            }
            if !out.is_empty() {
                return Ok(out);
            }
        }
    }
}

impl OrderedDistinctStream {
    async fn next_batch(
        &mut self,
        ctx: &QueryContext,
        batchspec: &BatchSpec,
    ) -> error_stack::Result<Vec<DatumRef>, QueryError> {
        loop {
            let batch = boxed_next_batch(&mut self.inner, ctx, batchspec).await?;
            if batch.is_empty() {
                return Ok(batch);
            }
            let mut out = Vec::new();
            for datum in batch {
                if self.last.as_ref() != Some(&datum) {
                    self.last = Some(datum.clone());
                    out.push(datum);
                }
            }
            if !out.is_empty() {
                return Ok(out);
            }
        }
    }
}
