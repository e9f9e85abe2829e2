use std::time::Instant;

use async_trait::async_trait;
use shrike_core::{HashRange, KeyRange, QueryError};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{ReadRequest, ReadResponse, WriteRequest, WriteResponse};

/// The table abstraction the read pipeline drives.
///
/// Implementations serve whole requests at once; streaming happens a
/// layer up, where responses are unsharded and buffered. Every method
/// takes an interruptor and fails with [`QueryError::Interrupted`] when
/// it fires mid-operation.
#[async_trait]
pub trait Table: Send + Sync {
    /// The `(region, hash-range)` pairs this table is sharded into.
    fn shard_layout(&self) -> Vec<(KeyRange, HashRange)>;

    async fn read(
        &self,
        request: ReadRequest,
        interruptor: &CancellationToken,
    ) -> error_stack::Result<ReadResponse, QueryError>;

    async fn write_batched(
        &self,
        request: WriteRequest,
        interruptor: &CancellationToken,
    ) -> error_stack::Result<WriteResponse, QueryError>;

    /// [`read`](Self::read) wrapped in a tracing span with row counts and
    /// timing attached.
    async fn read_with_profile(
        &self,
        request: ReadRequest,
        interruptor: &CancellationToken,
    ) -> error_stack::Result<ReadResponse, QueryError> {
        let kind = request.kind();
        let span = tracing::debug_span!("table_read", kind);
        async {
            let start = Instant::now();
            let response = self.read(request, interruptor).await?;
            let rows: usize = response.shards.iter().map(|shard| shard.items.len()).sum();
            tracing::debug!(
                elapsed_us = start.elapsed().as_micros() as u64,
                rows,
                shards = response.shards.len(),
                "read complete"
            );
            Ok(response)
        }
        .instrument(span)
        .await
    }
}
