/// Configured limits consumed by the pipeline.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// Bounds same-sindex-value run length and the geo processed set.
    pub array_size_limit: usize,
    /// Bounds the changefeed delivery queue.
    pub changefeed_queue_size: usize,
    /// Cap on concurrent non-feed sub-stream reads in a union.
    pub union_read_concurrency: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            array_size_limit: 100_000,
            changefeed_queue_size: 100_000,
            union_read_concurrency: 32,
        }
    }
}
