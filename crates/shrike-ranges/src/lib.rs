#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr
)]

//! Tracks, for an in-progress unsharded traversal, which sub-ranges of
//! the key space each hash-shard still owes us.
//!
//! Every `(region, hash-shard)` pair carries an explicit
//! [`RangeState`]: `Active` shards are read from, `Saturated` shards
//! have buffered more rows than the merge has consumed and are left
//! alone until their buffer drains, and `Exhausted` is terminal. The
//! transition logic is a pure function so the state machine can be
//! tested without a live shard fixture.

mod active_ranges;
mod state;

pub use active_ranges::*;
pub use state::*;
