#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr
)]

//! Lazily composed datum streams.
//!
//! A [`DatumStream`] wraps the shard-merging reader behind a closed set
//! of composition stages: eager arrays, lazy table reads, slice, map,
//! filter, ordered-distinct, and the concurrent union of many
//! sub-streams. Transform stages push down into shard-local reads when
//! the underlying read has not started yet.

mod stream;
mod union;

pub use stream::*;
pub use union::*;
