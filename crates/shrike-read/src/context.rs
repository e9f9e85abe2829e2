use shrike_core::QueryOptions;
use tokio_util::sync::CancellationToken;

/// Everything a read needs from its environment: configured limits and
/// the interruptor checked at every suspension point.
#[derive(Clone, Default)]
pub struct QueryContext {
    pub options: QueryOptions,
    pub interruptor: CancellationToken,
}

impl QueryContext {
    pub fn new(options: QueryOptions) -> Self {
        Self {
            options,
            interruptor: CancellationToken::new(),
        }
    }
}
