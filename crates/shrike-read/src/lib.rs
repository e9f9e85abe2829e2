#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr
)]

//! The shard-merging read engine.
//!
//! A [`ReadGen`] decides what the next physical read looks like for one
//! logical cursor; a [`ResponseReader`] issues those reads, feeds the raw
//! per-shard results through the unshard merge, and exposes a pull-based
//! "give me the next batch" interface that is resumable at every batch
//! boundary.

mod context;
mod readgen;
mod reader;
mod unshard;

pub use context::*;
pub use readgen::*;
pub use reader::*;
