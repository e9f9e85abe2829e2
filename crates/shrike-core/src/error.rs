/// The query error taxonomy.
///
/// Every failure the pipeline can surface to a caller falls into one of
/// these buckets; internal invariant violations are deliberately absent
/// (see [`sanity_check!`](crate::sanity_check)).
#[non_exhaustive]
#[derive(derive_more::Display, Debug)]
pub enum QueryError {
    /// Malformed query shape. Surfaced directly, never retried.
    #[display(fmt = "logic error: {}", _0)]
    Logic(String),
    /// A configured limit was exceeded. Client correctable; not retried.
    #[display(fmt = "resource limit exceeded: {}", _0)]
    ResourceLimit(String),
    /// A resumable operation lost its resume point (for example, stamp
    /// info went missing across a resharding). The caller is expected to
    /// retry the whole cursor.
    #[display(fmt = "resumable operation failed: {}", _0)]
    ResumableOpFailed(String),
    /// Cancellation. Always propagated, never swallowed.
    #[display(fmt = "operation interrupted")]
    Interrupted,
}

impl error_stack::Context for QueryError {}

impl QueryError {
    pub fn logic(msg: impl Into<String>) -> Self {
        QueryError::Logic(msg.into())
    }

    pub fn resource_limit(msg: impl Into<String>) -> Self {
        QueryError::ResourceLimit(msg.into())
    }
}

/// Assert an internal invariant of the pipeline.
///
/// Violations are implementation bugs, not user errors: they abort the
/// process and must not be caught or converted into [`QueryError`].
#[macro_export]
macro_rules! sanity_check {
    ($cond:expr) => {
        assert!($cond, "internal invariant violated: {}", stringify!($cond))
    };
    ($cond:expr, $($arg:tt)+) => {
        assert!($cond, $($arg)+)
    };
}
