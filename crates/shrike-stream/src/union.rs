use std::sync::Arc;

use shrike_batch::BatchSpec;
use shrike_core::{DatumRef, QueryError};
use shrike_read::QueryContext;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::stream::boxed_next_batch;
use crate::DatumStream;

/// The concurrent union of many sub-streams.
///
/// Each sub-stream runs on its own task, reads capped by a semaphore
/// (feed sub-streams are exempt: they must not block each other), and
/// results funnel into one bounded channel. The first error cancels the
/// siblings' in-flight reads through a shared abort token; dropping the
/// union aborts and joins everything.
pub struct UnionStream {
    state: UnionState,
}

enum UnionState {
    /// Sub-streams collected but nothing spawned yet; the fan-out starts
    /// on the first pull, which supplies the context.
    Pending(Vec<DatumStream>),
    Running(RunningUnion),
}

struct RunningUnion {
    rx: mpsc::Receiver<error_stack::Result<Vec<DatumRef>, QueryError>>,
    /// Keeps the spawned tasks owned: dropping the union aborts them.
    _tasks: JoinSet<()>,
    abort: CancellationToken,
    finished: bool,
}

impl UnionStream {
    pub(crate) fn new(streams: Vec<DatumStream>) -> Self {
        Self {
            state: UnionState::Pending(streams),
        }
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        match &self.state {
            UnionState::Pending(streams) => streams.iter().all(DatumStream::is_exhausted),
            UnionState::Running(running) => running.finished,
        }
    }

    pub(crate) async fn next_batch(
        &mut self,
        ctx: &QueryContext,
        batchspec: &BatchSpec,
    ) -> error_stack::Result<Vec<DatumRef>, QueryError> {
        if let UnionState::Pending(streams) = &mut self.state {
            let streams = std::mem::take(streams);
            self.state = UnionState::Running(spawn_substreams(streams, ctx, batchspec));
        }
        let UnionState::Running(running) = &mut self.state else {
            unreachable!("union just transitioned to running")
        };
        if running.finished {
            return Ok(Vec::new());
        }

        tokio::select! {
            biased;
            _ = ctx.interruptor.cancelled() => {
                running.abort.cancel();
                Err(error_stack::report!(QueryError::Interrupted))
            }
            message = running.rx.recv() => match message {
                None => {
                    running.finished = true;
                    Ok(Vec::new())
                }
                Some(Ok(batch)) => Ok(batch),
                Some(Err(error)) => {
                    running.abort.cancel();
                    Err(error)
                }
            }
        }
    }
}

impl Drop for UnionStream {
    fn drop(&mut self) {
        if let UnionState::Running(running) = &self.state {
            running.abort.cancel();
        }
    }
}

fn spawn_substreams(
    streams: Vec<DatumStream>,
    ctx: &QueryContext,
    batchspec: &BatchSpec,
) -> RunningUnion {
    // One in-flight batch per sub-stream, capped by the configured
    // delivery queue bound.
    let capacity = streams.len().clamp(1, ctx.options.changefeed_queue_size.max(1));
    let (tx, rx) = mpsc::channel(capacity);
    let abort = CancellationToken::new();
    let semaphore = Arc::new(Semaphore::new(ctx.options.union_read_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (index, mut sub) in streams.into_iter().enumerate() {
        let tx = tx.clone();
        let abort = abort.clone();
        let semaphore = semaphore.clone();
        let ctx = ctx.clone();
        let batchspec = batchspec.clone();
        let is_feed = sub.is_feed();

        tasks.spawn(async move {
            loop {
                let _permit = if is_feed {
                    None
                } else {
                    tokio::select! {
                        _ = abort.cancelled() => break,
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                    }
                };
                let result = tokio::select! {
                    _ = abort.cancelled() => break,
                    result = boxed_next_batch(&mut sub, &ctx, &batchspec) => result,
                };
                match result {
                    Ok(batch) if batch.is_empty() => break,
                    Ok(batch) => {
                        if tx.send(Ok(batch)).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        let _ = tx.send(Err(error)).await;
                        abort.cancel();
                        break;
                    }
                }
            }
            tracing::trace!(substream = index, "union sub-stream finished");
        });
    }

    RunningUnion {
        rx,
        _tasks: tasks,
        abort,
        finished: false,
    }
}
